//! wa-relay - forwards keyword-matching WhatsApp group messages to one
//! target group, with a small web dashboard for configuration and pairing.

pub mod client;
pub mod config;
pub mod filter;
pub mod qr;
pub mod router;
pub mod status;
pub mod web;
