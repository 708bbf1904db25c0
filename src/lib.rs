pub mod error;
pub mod exec;
pub mod svga;
pub mod utils;

pub use error::{ErrorClass, ErrorKind, ExecError, ExecResult};
pub use exec::{DeviceConfig, ExecbufArg, ExecbufReply, SvgaDevice};
pub use svga::{CommandRing, SoftFifo};
