pub(crate) mod actions;
pub(crate) mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod harness;
pub(crate) mod interp;
pub mod page;
pub(crate) mod scheduler;
pub(crate) mod watchdog;

pub use config::{ScriptConfig, ScriptConfigOverrides};
pub use engine::{
    AlertHandler, CollectingAlertHandler, HostBinder, LogAlertHandler, ScriptEngine, WindowContext,
};
pub use error::{CollectingReporter, ErrorReporter, LogReporter, ScriptError, ScriptErrorKind};
pub use interp::{BoundCallback, CompiledUnit, ScriptCallback};
pub use page::{Page, WindowId};
pub use scheduler::JobId;

pub use rhai;
