pub mod config;
pub mod decoder;
pub mod fence;
pub mod objects;
pub mod placement;
pub mod reloc;
pub mod submit;
pub mod tracker;
pub mod validate;

pub use config::DeviceConfig;
pub use fence::{Fence, FenceManager, SubmitStatus};
pub use objects::{CancelToken, ClientFile, ObjectTable};
pub use placement::{BufferObject, DevicePlacement};
pub use submit::{ExecbufArg, ExecbufReply, FenceRepSink, FenceSignaled, SvgaDevice};
