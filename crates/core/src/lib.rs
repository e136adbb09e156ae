//! Core emulator primitives and traits shared across emulated systems.

pub mod cpu_lr35902;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A decoded framebuffer ready for upload to a host texture.
    ///
    /// Pixels are packed big-endian RGBA8 (the first byte of every pixel is
    /// red), matching the "upload this `width*height*4` buffer" host contract.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u8>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height * 4) as usize],
            }
        }

        pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
            let idx = ((y * self.width + x) * 4) as usize;
            self.pixels[idx..idx + 4].copy_from_slice(&rgba);
        }
    }

    /// One channel of a stereo sample pair, normalized to `[-1.0, 1.0]`.
    pub type AudioSample = f32;
}

use serde_json::Value;

/// Description of a mount point (media slot) that a system supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Unique identifier for this mount point (e.g., "Cartridge", "BIOS", "Floppy1")
    pub id: String,
    /// User-friendly name for display (e.g., "Cartridge Slot", "BIOS ROM")
    pub name: String,
    /// File extensions accepted by this mount point (e.g., ["nes", "unf"])
    pub extensions: Vec<String>,
    /// Whether this mount point is required for the system to function
    pub required: bool,
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Emulate until a frame is produced and return a framebuffer.
    fn step_frame(&mut self) -> Result<types::Frame, Self::Error>;

    /// Return a JSON-serializable save state for debugging.
    /// Note: Save states should NOT include ROM/cartridge data.
    /// Only save emulator state (CPU, RAM, PPU state, etc.)
    fn save_state(&self) -> Value;

    /// Load a JSON save state.
    /// Returns error if the state is incompatible or requires different mounted media.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;

    /// Check if this system supports save/load state functionality
    fn supports_save_states(&self) -> bool {
        false // Default: no save state support
    }

    /// Get the list of mount points this system supports
    fn mount_points(&self) -> Vec<MountPointInfo>;

    /// Load media into a specific mount point
    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Unload media from a specific mount point
    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error>;

    /// Check if a mount point has media loaded
    fn is_mounted(&self, mount_point_id: &str) -> bool;
}
