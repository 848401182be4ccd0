//! Messaging fabric: the JSON wire envelope and the six role-typed socket
//! contexts the commander and workers talk through.
//!
//! Port layout relative to the configured base port `P`:
//!
//! | Port  | Socket     | Traffic                      |
//! |-------|------------|------------------------------|
//! | `P`   | Publisher  | heartbeats out               |
//! | `P+1` | Pusher     | test specs out               |
//! | `P+2` | Responder  | file service                 |
//! | `P+3` | Responder  | result ingest                |
//! | `P+4` | Responder  | heartbeat response ingest    |

pub mod socket;
pub mod wire;

pub use socket::{Publisher, Puller, Pusher, Requester, Responder, Subscriber};
pub use wire::{Channel, Message, COMMON_KEY};
