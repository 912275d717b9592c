//! HTTP gateway: batch uploads, delivery status queries, the email feedback
//! webhook and dead-letter administration.

pub mod routes;
pub mod state;
