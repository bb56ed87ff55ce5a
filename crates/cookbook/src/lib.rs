//! PaaS cookbook: the ordered pipeline taking a job from its raw description
//! to deployed and exposed workloads.
//!
//! Fixed steps sit at priorities 10 to 200 (ping, set timeout, receive job,
//! deserialize, prepare workspace, configure cloning agent, clone, configure
//! conductor, read deployment config, compile, pre-build hook, connect
//! registry, build images, build volumes, connect cluster, deploy, expose,
//! final, send history, unset timeout). Extra steps slot in with `add_step`.

#![forbid(unsafe_code)]

pub mod cloning;
pub mod cookbook;
pub mod kitchen;
pub mod plan;
pub mod sink;
pub mod source;
pub mod stages;
pub mod step;
pub mod timer;

pub use cloning::{CloneRequest, CloningAgent, GitCloningAgent};
pub use cookbook::{Cookbook, Outcome};
pub use kitchen::{Kitchen, KitchenConfig};
pub use plan::{keys, Key, WorkPlan};
pub use sink::{EventSink, FanoutSink, HistoryEvent, HistorySink, TracingSink};
pub use source::{FileJobSource, JobSource, StaticJobSource};
pub use stages::Stage;
pub use step::{Flow, Step};
pub use timer::JobTimer;
