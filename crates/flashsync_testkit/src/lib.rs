//! # flashsync testkit
//!
//! Test utilities for flashsync.
//!
//! This crate provides:
//! - [`RemoteCollection`], an in-process collection server
//! - [`RemoteMedia`], an in-process media server
//! - [`LoopbackClient`], an HTTP client that answers from those servers
//! - Row, object and collection fixtures
//! - [`init_test_logging`] for tracing output in tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flashsync_engine::{CollectionSyncer, SyncConfig, SyncOutcome};
//! use flashsync_testkit::prelude::*;
//!
//! let (mut client, server_state) = synced_pair();
//! let server = RemoteCollection::new(server_state);
//! let config = SyncConfig::default();
//! let outcome = CollectionSyncer::new(&server, &mut client, &config).sync();
//! assert_eq!(outcome, SyncOutcome::NoChanges);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod logging;
pub mod loopback;
pub mod remote_collection;
pub mod remote_media;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::logging::*;
    pub use crate::loopback::*;
    pub use crate::remote_collection::*;
    pub use crate::remote_media::*;
}

pub use fixtures::*;
pub use logging::init_test_logging;
pub use loopback::{Form, LoopbackClient};
pub use remote_collection::{RemoteCollection, TEST_HOST_KEY};
pub use remote_media::{RemoteMedia, TEST_MEDIA_SESSION};
