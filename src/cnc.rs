//! The CnC (command-and-control) file: layout, mapping, and the driver
//! handshake.

pub mod connector;
pub mod layout;
pub mod mapped;

pub use connector::{CncBindings, connect_to_driver};
pub use layout::{CNC_FILE_NAME, CNC_VERSION, CncMetadata};
pub use mapped::CncFile;
