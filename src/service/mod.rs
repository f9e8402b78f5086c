//! # Service Layer
//!
//! Components built directly on the transport services.
//!
//! ## Components
//! - **Session / SessionManager**: protocol-agnostic session registry with
//!   an accept loop and error-driven auto-removal
//! - **TimerService**: timed waits resolved by the external tick

pub mod session;
pub mod timer;

pub use session::{Session, SessionManager};
pub use timer::TimerService;
