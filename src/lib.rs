/*!
# Overview
swiftspan bridges a local Swift-style object cluster with remote object
stores speaking the Swift or S3 protocol, presenting the illusion of a
single namespace spanning both sides.

Three cooperating pieces live in this crate:

- The **sync engine** ([`sync`]) consumes the cluster's container
  change feed and propagates mutations (PUT, POST, DELETE, expiration) to a
  remote bucket, with large-object translation and optional local
  retention.
- The **migrator** ([`migrator`]) runs the inverse direction: it lists
  remote buckets, pulls new or changed objects into the cluster while
  preserving timestamps, metadata, and manifest structure, and prunes
  local copies whose source objects disappeared.
- The **shunt** ([`shunt`]) is proxy middleware that transparently
  services reads and listings against objects that were archived away or
  not yet migrated.

Both directions speak through the [`provider`] capability surface, which
hides the differences between Swift and S3 semantics, including the
mapping between static/dynamic large objects and multipart uploads
([`largeobject`]). Durable progress lives in per-container status files
([`status`]); work is partitioned across processes with a stable hash
ring ([`ring`]).

The `swiftspan` binary wraps the library in `sync`, `migrate`, and
`check-config` subcommands; the shunt is embedded into the proxy host
process as a library type.
*/

pub use config::Config;

pub mod config;
pub mod largeobject;
pub mod migrator;
pub mod provider;
pub mod ring;
pub mod shunt;
pub mod stats;
pub mod status;
pub mod sync;
pub mod types;
