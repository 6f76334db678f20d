pub mod dispatch;
pub mod parse;
pub mod shell;

pub use shell::run_session;
