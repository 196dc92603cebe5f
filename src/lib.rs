//! Courier: outbound WhatsApp delivery with a durable fallback log.
//!
//! A single dispatch worker owns the WhatsApp connection; every caller goes
//! through it in FIFO order. Media sends that fail for any reason leave one
//! row in a CSV log so they can be retried by hand.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod lifecycle;
pub mod whatsapp;

pub mod dispatch;
pub mod fallback;
pub mod media;

pub mod pipeline;
pub mod server;
