//! wagate - HTTP-to-WhatsApp gateway.
//!
//! One supervised connection to the chat network, a REST surface for
//! sending messages and inspecting state, and an in-band STOP/START kill
//! switch driven by chat commands.

pub mod client;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod handlers;
pub mod response;
pub mod server;
pub mod supervisor;
pub mod switch;
