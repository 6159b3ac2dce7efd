#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use hostport_controller_core as core;
pub use hostport_controller_k8s_api as k8s;
pub use hostport_controller_k8s_client as client;

mod args;
mod dispatch;
mod metrics;

pub use self::{
    args::Args,
    dispatch::{Backoff, Dispatcher, FetchPod, Key},
    metrics::SyncMetrics,
};
