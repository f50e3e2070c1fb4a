//! Remote messaging integration tests.
//!
//! Every test serves a real tonic server on 127.0.0.1 and talks to it through
//! `RemoteClient`.

mod support;
mod streaming;
mod events;
