pub mod ast;
pub mod cli;
pub mod compiler;
pub mod diagnostics;
pub mod error;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod report;
pub mod runtime;

pub use diagnostics::Diagnostic;
pub use error::PipeTestError;
pub use loader::{FsModuleLoader, ModuleLoader};
pub use runtime::transport::{CancelToken, HttpTransport, ReqwestTransport};
