//! SMTP submission front end

mod handler;
mod server;
mod session;

pub use handler::SmtpHandler;
pub use server::SmtpServer;
pub use session::{Delivery, Session, SessionLimits};
