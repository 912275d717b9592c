//! Notification delivery and delivery-outcome tracking.
//!
//! The dispatcher drains the notification work queue, sends each message
//! through a [`MailSender`](sender::MailSender) and records a SENT delivery
//! record. The feedback sink applies bounce, complaint and delivery outcomes
//! to those records.

pub mod dispatcher;
pub mod feedback;
pub mod memory;
pub mod render;
pub mod resend;
pub mod sender;
pub mod store;
