pub mod http_probe;
pub mod readiness_probe;

pub use http_probe::{HttpProbe, ProbeResult};
pub use readiness_probe::{ProbeSnapshot, ReadinessCheck, ReadinessOutcome, ReadinessProbe};
