//! Job key conventions.
//!
//! Clients store per-job state under `job.<dothex id>`, with job-writable
//! state under a `.guest` subtree. The engine enforces no policy on these
//! paths; the helpers only build them consistently.

use crate::{codec, Fluid, StringType};

/// Key of a job's KVS directory, or of `key` within it.
///
/// The dotted-hex ID doubles as a directory hierarchy, spreading jobs over
/// four directory levels.
pub fn job_key(id: Fluid, key: Option<&str>) -> String {
    let dir = format!("job.{}", codec::encode(id, StringType::DotHex));
    match key {
        Some(key) => format!("{dir}.{key}"),
        None => dir,
    }
}

/// Key within a job's guest (job-writable) subtree.
pub fn job_guest_key(id: Fluid, key: &str) -> String {
    job_key(id, Some(&format!("guest.{key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_nest_by_dothex_groups() {
        assert_eq!(job_key(0, None), "job.0000.0000.0000.0000");
        assert_eq!(job_key(0x1234, Some("eventlog")), "job.0000.0000.0000.1234.eventlog");
        assert_eq!(job_guest_key(0, "output"), "job.0000.0000.0000.0000.guest.output");
    }
}
