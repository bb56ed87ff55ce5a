//! PaaS cluster side: driver directory, multi-cluster fan-out and the
//! transcription pipeline, with a Kubernetes implementation.

#![forbid(unsafe_code)]

pub mod api;
pub mod client;
pub mod directory;
pub mod driver;
pub mod kubernetes;
pub mod transcriber;

pub use api::{ClusterApi, KubeClusterApi, RecordingClusterApi};
pub use client::MultiClusterClient;
pub use directory::{ClusterClients, ConfigurableCluster, Directory, DriverConfig, DriverFactory};
pub use driver::{ClusterReport, Driver, Transcribed};
pub use transcriber::{Phase, TranscribeContext, Transcriber, TranscriberCollection};
