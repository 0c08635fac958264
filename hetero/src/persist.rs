//! The job log (§6's "Persisted state"): one tab-separated row per finished
//! job, appended as jobs drain off the finished-job ring buffer.
//!
//! Grounded on `Planner::Wait` in the original runtime, which opens
//! `log_path_` once at construction, writes a header row, and appends one
//! row per job as it's collected. `Instant` carries no fixed epoch, so
//! timestamp columns are microseconds elapsed since the writer itself was
//! created rather than wall-clock time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::RuntimeError;
use crate::job::{DeviceId, Job, SchedulerId};

const HEADER: &str = "sched_id\tmodel_name\tmodel_id\tdevice_id\tsubgraph_idx\tenqueue_time\tinvoke_time\tend_time\tprofiled_time\texpected_latency\tslo_us\tstatus\tis_final_subgraph\n";

/// Appends job records to a TSV file, one row per completed (sub)job.
pub struct JobLogWriter {
    file: Mutex<BufWriter<File>>,
    started_at: Instant,
}

impl JobLogWriter {
    /// Creates (truncating) `path` and writes the column header.
    pub fn create(path: impl AsRef<Path>, started_at: Instant) -> Result<Self, RuntimeError> {
        let file = File::create(path.as_ref()).map_err(|e| RuntimeError::PathInvalid(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(HEADER.as_bytes()).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        Ok(JobLogWriter { file: Mutex::new(writer), started_at })
    }

    /// Appends one row for `job`, scheduled under `sched_id` onto `device`.
    pub fn write_job(
        &self,
        sched_id: SchedulerId,
        model_name: &str,
        device: DeviceId,
        job: &Job,
        is_final_subgraph: bool,
    ) -> Result<(), RuntimeError> {
        let micros = |t: Option<Instant>| t.map_or(String::new(), |t| t.saturating_duration_since(self.started_at).as_micros().to_string());

        let row = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            sched_id as u8,
            model_name,
            job.model_id,
            device.index(),
            job.subgraph_idx.map_or(String::new(), |idx| idx.to_string()),
            micros(job.enqueue_time),
            micros(job.invoke_time),
            micros(job.end_time),
            job.profiled_latency.map_or(String::new(), |d| d.as_micros().to_string()),
            job.expected_latency.map_or(String::new(), |d| d.as_micros().to_string()),
            job.slo_us,
            status_label(job.status),
            is_final_subgraph,
        );

        let mut file = self.file.lock().unwrap();
        file.write_all(row.as_bytes()).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        file.flush().map_err(|e| RuntimeError::Internal(e.to_string()))
    }
}

fn status_label(status: crate::job::JobStatus) -> &'static str {
    use crate::job::JobStatus::*;
    match status {
        Queued => "queued",
        Success => "success",
        SloViolation => "slo_violation",
        InputCopyFailure => "input_copy_failure",
        OutputCopyFailure => "output_copy_failure",
        InvokeFailure => "invoke_failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::time::Duration;

    fn sample_job() -> Job {
        let mut job = Job::new(1, 7, 5_000);
        job.job_id = 42;
        job.subgraph_idx = Some(2);
        job.status = JobStatus::Success;
        let now = Instant::now();
        job.enqueue_time = Some(now);
        job.invoke_time = Some(now + Duration::from_micros(100));
        job.end_time = Some(now + Duration::from_micros(900));
        job.profiled_latency = Some(Duration::from_micros(800));
        job.expected_latency = Some(Duration::from_micros(750));
        job
    }

    #[test]
    fn writes_header_then_one_row_per_job() {
        let path = std::env::temp_dir().join(format!("hetero-job-log-{:?}.tsv", std::thread::current().id()));
        let writer = JobLogWriter::create(&path, Instant::now()).unwrap();
        writer.write_job(SchedulerId::Heft, "mobilenet", DeviceId::Gpu, &sample_job(), true).unwrap();
        writer.write_job(SchedulerId::Heft, "mobilenet", DeviceId::Gpu, &sample_job(), false).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), HEADER.trim_end());
        let first = lines.next().unwrap();
        assert!(first.starts_with("4\tmobilenet\t7\t2\t2\t"));
        assert!(first.ends_with("success\ttrue"));
        let second = lines.next().unwrap();
        assert!(second.ends_with("success\tfalse"));
        assert!(lines.next().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_timestamps_render_as_empty_columns() {
        let path = std::env::temp_dir().join(format!("hetero-job-log-empty-{:?}.tsv", std::thread::current().id()));
        let writer = JobLogWriter::create(&path, Instant::now()).unwrap();
        let job = Job::new(1, 0, 0);
        writer.write_job(SchedulerId::RoundRobin, "net", DeviceId::Cpu, &job, false).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let row = contents.lines().nth(1).unwrap();
        let cols: Vec<&str> = row.split('\t').collect();
        assert_eq!(cols[4], ""); // subgraph_idx
        assert_eq!(cols[5], ""); // enqueue_time
        assert_eq!(cols[6], ""); // invoke_time
        assert_eq!(cols[7], ""); // end_time

        std::fs::remove_file(&path).ok();
    }
}
