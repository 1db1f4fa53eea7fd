pub mod process;

pub use process::{exit_code, send_signal};
