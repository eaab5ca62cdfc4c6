pub mod capture;
pub mod codec;
pub mod dump;
pub mod error;
pub mod net;
pub mod playout;
pub mod reactor;
pub mod timer;
pub mod translate;

pub use capture::{CaptureHeader, CaptureReader, CaptureRecord, CaptureWriter};
pub use codec::{DecodeError, PayloadTable};
pub use dump::{DumpConfig, DumpFormat, Recorder};
pub use error::{Result, RtpError};
pub use playout::{PacketSink, PlayoutConfig, Player};
pub use reactor::Reactor;
pub use timer::TimerQueue;
pub use translate::{Endpoint, Relay, Translator, TranslatorConfig};
