//! End-to-end scenarios driving a real [`Planner`] and real worker threads
//! through the crate's public surface only, standing in for the tensor
//! kernels and cloud transport with the in-process stubs `executor`
//! provides. Each test exercises one placement/lifecycle property the unit
//! tests scattered through the individual modules only cover in isolation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hetero_runtime::catalog::{ModelSpec, SubgraphCatalog, SubgraphPreparationType};
use hetero_runtime::executor::TableExecutor;
use hetero_runtime::job::{DeviceId, Job, JobStatus, SchedulerId, WorkerId};
use hetero_runtime::models::ModelManager;
use hetero_runtime::planner::Planner;
use hetero_runtime::resource::{ResourceConfig, ResourceMonitor, ResourceSource, SysfsSource};
use hetero_runtime::tensor::{Tensor, TensorRingBuffer};
use hetero_runtime::worker::{CpuSet, DeviceQueueWorker, WorkerHandle};

fn trivial_spec() -> ModelSpec {
    ModelSpec {
        num_ops: 1,
        input_tensors: vec![0],
        output_tensors: vec![1],
        node_output_tensors: vec![0, 1],
        tensor_types: Default::default(),
        unsupported_ops: Default::default(),
    }
}

fn empty_monitor() -> Arc<ResourceMonitor> {
    ResourceMonitor::new(Box::new(SysfsSource), Vec::new())
}

/// A `WorkerHandle` that never actually runs anything: it just appends its
/// own id to a shared log whenever a scheduler gives it a job, so a test can
/// observe *which* worker a scheduling decision landed on without paying for
/// a real execution thread.
struct RecordingWorker {
    id: WorkerId,
    waiting: Duration,
    placements: Arc<Mutex<Vec<WorkerId>>>,
}

impl WorkerHandle for RecordingWorker {
    fn id(&self) -> WorkerId {
        self.id
    }
    fn give_job(&self, _job: Job, _subgraph_idx: usize) -> bool {
        self.placements.lock().unwrap().push(self.id);
        true
    }
    fn waiting_time(&self, _models: &ModelManager, _catalog: &SubgraphCatalog) -> Duration {
        self.waiting
    }
    fn pause(&self) {}
    fn resume(&self) {}
    fn kill(&self) {}
}

/// Blocks the calling thread, polling `cond` every couple of milliseconds,
/// until it returns `true` or `attempts` polls have passed.
fn poll_until(mut cond: impl FnMut() -> bool, attempts: u32) -> bool {
    for _ in 0..attempts {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// One model, one CPU worker, one job with canned input: the job must come
/// back `Success` with the executor's output copied into the caller's
/// output handle.
#[test]
fn single_model_single_worker_round_trips_a_job() {
    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cpu, 0, 1);

    let tensors = TensorRingBuffer::new(16);

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = DeviceQueueWorker::new(0, CpuSet { cores: vec![] }, false, Duration::from_millis(10), tx);
    let handle: Arc<dyn WorkerHandle> = Arc::clone(&worker) as Arc<dyn WorkerHandle>;

    let planner = Planner::new(&[SchedulerId::FixedDevice], vec![(handle, DeviceId::Cpu)], catalog, models, tensors, 10, None);
    planner.set_fixed_placement(model_id, 0);

    let mut executor = TableExecutor::default();
    executor.responses.insert(model_id, vec![Tensor::from_bytes(0, vec![1, 4], vec![10, 20, 30, 40])]);
    let executor = Arc::new(executor);

    let worker_for_thread = Arc::clone(&worker);
    let planner_for_worker = Arc::clone(&planner);
    let executor_for_worker = Arc::clone(&executor);
    let worker_thread = std::thread::spawn(move || {
        worker_for_thread.run(
            planner_for_worker.catalog(),
            planner_for_worker.models(),
            executor_for_worker.as_ref(),
            planner_for_worker.tensors(),
            &[],
        );
    });
    let planner_thread = planner.spawn(CpuSet { cores: vec![] }, rx);

    let input_handle = planner.tensors().alloc(vec![Tensor::from_bytes(0, vec![1, 4], vec![1, 2, 3, 4])]);
    let output_handle = planner.tensors().alloc(vec![Tensor::from_bytes(0, vec![1, 4], vec![0, 0, 0, 0])]);

    let mut job = Job::new(1, model_id, 0);
    job.input_handle = Some(input_handle);
    job.output_handle = Some(output_handle);
    let job_id = planner.enqueue_request(job);

    let finished = planner.wait(job_id);
    assert_eq!(finished.status, JobStatus::Success);

    let output = planner.tensors().get(output_handle).unwrap();
    assert_eq!(&output[0].data[..], &[10u8, 20, 30, 40][..]);

    planner.shutdown();
    worker.kill();
    planner_thread.join().unwrap();
    worker_thread.join().unwrap();
}

/// Once the planner's request queue empties and its scheduling thread goes
/// idle, a second request still gets picked up and finished rather than
/// sitting forever behind a loop that only wakes on shutdown.
#[test]
fn a_second_request_enqueued_after_the_planner_goes_idle_still_completes() {
    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cpu, 0, 1);

    let tensors = TensorRingBuffer::new(16);

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = DeviceQueueWorker::new(0, CpuSet { cores: vec![] }, false, Duration::from_millis(10), tx);
    let handle: Arc<dyn WorkerHandle> = Arc::clone(&worker) as Arc<dyn WorkerHandle>;

    let planner = Planner::new(&[SchedulerId::FixedDevice], vec![(handle, DeviceId::Cpu)], catalog, models, tensors, 10, None);
    planner.set_fixed_placement(model_id, 0);

    let mut executor = TableExecutor::default();
    executor.responses.insert(model_id, vec![Tensor::from_bytes(0, vec![1, 4], vec![1, 1, 1, 1])]);
    let executor = Arc::new(executor);

    let worker_for_thread = Arc::clone(&worker);
    let planner_for_worker = Arc::clone(&planner);
    let executor_for_worker = Arc::clone(&executor);
    let worker_thread = std::thread::spawn(move || {
        worker_for_thread.run(
            planner_for_worker.catalog(),
            planner_for_worker.models(),
            executor_for_worker.as_ref(),
            planner_for_worker.tensors(),
            &[],
        );
    });
    let planner_thread = planner.spawn(CpuSet { cores: vec![] }, rx);

    let run_one_job = |planner: &Arc<Planner>| {
        let input_handle = planner.tensors().alloc(vec![Tensor::from_bytes(0, vec![1, 4], vec![1, 2, 3, 4])]);
        let output_handle = planner.tensors().alloc(vec![Tensor::from_bytes(0, vec![1, 4], vec![0, 0, 0, 0])]);
        let mut job = Job::new(1, model_id, 0);
        job.input_handle = Some(input_handle);
        job.output_handle = Some(output_handle);
        let job_id = planner.enqueue_request(job);
        planner.wait(job_id)
    };

    let first = run_one_job(&planner);
    assert_eq!(first.status, JobStatus::Success);

    // Give the scheduling thread time to drain its queue and go idle before
    // the second request arrives — this is exactly the window the wake path
    // used to miss.
    std::thread::sleep(Duration::from_millis(30));

    let second = run_one_job(&planner);
    assert_eq!(second.status, JobStatus::Success, "a request enqueued after the planner went idle must still be processed");

    planner.shutdown();
    worker.kill();
    planner_thread.join().unwrap();
    worker_thread.join().unwrap();
}

/// A finished job appends exactly one TSV row to the configured job log,
/// carrying the scheduler that placed it, the device it ran on, and its
/// terminal status.
#[test]
fn a_finished_job_appends_a_row_to_the_configured_job_log() {
    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cpu, 0, 1);

    let tensors = TensorRingBuffer::new(16);

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = DeviceQueueWorker::new(0, CpuSet { cores: vec![] }, false, Duration::from_millis(10), tx);
    let handle: Arc<dyn WorkerHandle> = Arc::clone(&worker) as Arc<dyn WorkerHandle>;

    let log_path = std::env::temp_dir().join(format!("hetero-scenario-job-log-{:?}.tsv", std::thread::current().id()));
    let job_log = hetero_runtime::JobLogWriter::create(&log_path, std::time::Instant::now()).unwrap();

    let planner =
        Planner::new(&[SchedulerId::FixedDevice], vec![(handle, DeviceId::Cpu)], catalog, models, tensors, 10, Some(job_log));
    planner.set_fixed_placement(model_id, 0);

    let mut executor = TableExecutor::default();
    executor.responses.insert(model_id, vec![Tensor::from_bytes(0, vec![1, 4], vec![10, 20, 30, 40])]);
    let executor = Arc::new(executor);

    let worker_for_thread = Arc::clone(&worker);
    let planner_for_worker = Arc::clone(&planner);
    let executor_for_worker = Arc::clone(&executor);
    let worker_thread = std::thread::spawn(move || {
        worker_for_thread.run(
            planner_for_worker.catalog(),
            planner_for_worker.models(),
            executor_for_worker.as_ref(),
            planner_for_worker.tensors(),
            &[],
        );
    });
    let planner_thread = planner.spawn(CpuSet { cores: vec![] }, rx);

    let input_handle = planner.tensors().alloc(vec![Tensor::from_bytes(0, vec![1, 4], vec![1, 2, 3, 4])]);
    let output_handle = planner.tensors().alloc(vec![Tensor::from_bytes(0, vec![1, 4], vec![0, 0, 0, 0])]);

    let mut job = Job::new(1, model_id, 0);
    job.model_name = "trivial".to_string();
    job.input_handle = Some(input_handle);
    job.output_handle = Some(output_handle);
    let job_id = planner.enqueue_request(job);
    let finished = planner.wait(job_id);
    assert_eq!(finished.status, JobStatus::Success);

    planner.shutdown();
    worker.kill();
    planner_thread.join().unwrap();
    worker_thread.join().unwrap();

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let mut lines = contents.lines();
    assert!(lines.next().unwrap().starts_with("sched_id\tmodel_name"));
    let row = lines.next().expect("one row for the finished job");
    let cols: Vec<&str> = row.split('\t').collect();
    assert_eq!(cols[0], "0"); // FixedDevice
    assert_eq!(cols[1], "trivial");
    assert_eq!(cols[3], "0"); // DeviceId::Cpu
    assert_eq!(cols[11], "success");
    assert!(lines.next().is_none());

    std::fs::remove_file(&log_path).ok();
}

/// A model with one op unsupported on the second worker partitions into a
/// prefix/fallback/suffix chain on that worker while the fully-capable
/// worker keeps its single whole-model subgraph, and a query for candidates
/// starting at op 0 sees both the whole-model and the prefix entry.
#[test]
fn an_unsupported_middle_op_splits_the_model_into_a_fallback_chain() {
    let mut unsupported = BTreeMap::new();
    unsupported.insert(1, vec![2]);
    let spec = ModelSpec {
        num_ops: 5,
        input_tensors: vec![0],
        output_tensors: vec![5],
        node_output_tensors: (0..=5).collect(),
        tensor_types: Default::default(),
        unsupported_ops: unsupported,
    };

    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(spec, &[0, 1], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();

    assert!(catalog.subgraph_idx(model_id, 0).is_some(), "the fully-supporting worker keeps one whole-model subgraph");
    assert!(catalog.subgraph_idx(model_id, 1).is_none(), "the gapped worker never gets a whole-model subgraph");

    let candidates = catalog.subgraph_candidates(model_id, 0);
    assert_eq!(candidates.len(), 2, "both the whole-model subgraph and the gapped worker's prefix start at op 0");

    let gapped_start = candidates.iter().copied().find(|&idx| catalog.get(idx).worker_id == 1).expect("worker 1 has a subgraph starting at op 0");
    let mut chain = vec![gapped_start];
    let mut cursor = gapped_start;
    while let Some(next) = catalog.get(cursor).next {
        chain.push(next);
        cursor = next;
    }
    assert_eq!(chain.len(), 3, "the gap around op 2 is covered by a fallback subgraph, chained prefix -> fallback -> suffix");
    assert_eq!(catalog.get(chain[0]).worker_id, 1);
    assert_eq!(catalog.get(chain[1]).worker_id, 0, "the unsupported op falls back to the fully-capable worker");
    assert_eq!(catalog.get(chain[1]).start_op, 2);
    assert_eq!(catalog.get(chain[1]).end_op, 3);
    assert_eq!(catalog.get(chain[2]).worker_id, 1);
    assert_eq!(catalog.get(chain[2]).end_op, 5);
}

/// A job whose slack, at the earliest possible dispatch, is already smaller
/// than the predicted time to run it is dropped as an SLO violation rather
/// than ever being handed to a worker.
#[test]
fn a_job_that_cannot_meet_its_deadline_is_dropped_as_an_slo_violation() {
    struct FixedWaitWorker {
        id: WorkerId,
        waiting: Duration,
    }
    impl WorkerHandle for FixedWaitWorker {
        fn id(&self) -> WorkerId {
            self.id
        }
        fn give_job(&self, _job: Job, _subgraph_idx: usize) -> bool {
            panic!("an unattainable job should never reach give_job");
        }
        fn waiting_time(&self, _models: &ModelManager, _catalog: &SubgraphCatalog) -> Duration {
            self.waiting
        }
        fn pause(&self) {}
        fn resume(&self) {}
        fn kill(&self) {}
    }

    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();
    let sg = catalog.subgraph_idx(model_id, 0).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cpu, 0, 1);
    // Seed the EWMA so the worker's predicted latency for this model is 100ms.
    let mut seed = Job::new(0, model_id, 0);
    seed.worker_id = Some(0);
    seed.profiled_latency = Some(Duration::from_millis(100));
    models.update(&seed, catalog.get(sg));

    let tensors = TensorRingBuffer::new(16);
    let worker: Arc<dyn WorkerHandle> = Arc::new(FixedWaitWorker { id: 0, waiting: Duration::from_millis(500) });
    let planner = Planner::new(&[SchedulerId::LeastSlackFirst], vec![(worker, DeviceId::Cpu)], catalog, models, tensors, 10, None);

    let (_tx, rx) = crossbeam_channel::unbounded();
    let planner_thread = planner.spawn(CpuSet { cores: vec![] }, rx);

    // 500ms already waiting + 100ms predicted far exceeds a 200ms deadline.
    let job_id = planner.enqueue_request(Job::new(1, model_id, 200_000));

    let finished = planner.wait(job_id);
    assert_eq!(finished.status, JobStatus::SloViolation);

    planner.shutdown();
    planner_thread.join().unwrap();
}

/// Two real `DeviceQueueWorker`s: one backlogged five jobs deep, the other
/// idle after finishing a single job of its own. With work stealing enabled
/// on the idle one, it must pull at least one job off the backlogged peer's
/// tail within a short bounded wait.
#[test]
fn an_idle_worker_steals_a_backlogged_peers_tail_job() {
    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0, 1], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();
    let sg_a = catalog.subgraph_idx(model_id, 0).unwrap();
    let sg_b = catalog.subgraph_idx(model_id, 1).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cpu, 0, 1);
    models.register_worker(1, DeviceId::Cpu, 0, 1);
    let mut seed_a = Job::new(0, model_id, 0);
    seed_a.worker_id = Some(0);
    seed_a.profiled_latency = Some(Duration::from_millis(50));
    models.update(&seed_a, catalog.get(sg_a));
    let mut seed_b = Job::new(0, model_id, 0);
    seed_b.worker_id = Some(1);
    seed_b.profiled_latency = Some(Duration::from_millis(5));
    models.update(&seed_b, catalog.get(sg_b));
    let models = Mutex::new(models);

    let tensors = TensorRingBuffer::new(16);
    let seed_input = tensors.alloc(vec![Tensor::from_bytes(0, vec![1], vec![1])]);

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker_a = DeviceQueueWorker::new(0, CpuSet { cores: vec![] }, false, Duration::from_millis(10), tx.clone());
    let worker_b = DeviceQueueWorker::new(1, CpuSet { cores: vec![] }, true, Duration::from_millis(10), tx);

    for i in 0..5u64 {
        let mut job = Job::new(i, model_id, 0);
        job.job_id = i + 1;
        assert!(worker_a.give_job(job, sg_a));
    }
    assert_eq!(worker_a.queue_len(), 5);

    let mut seed_job = Job::new(100, model_id, 0);
    seed_job.job_id = 1000;
    seed_job.input_handle = Some(seed_input);
    assert!(worker_b.give_job(seed_job, sg_b));

    let mut executor = TableExecutor::default();
    executor.responses.insert(model_id, Vec::new());

    let peer: Arc<dyn WorkerHandle> = Arc::clone(&worker_a) as Arc<dyn WorkerHandle>;
    let peers = vec![peer];

    std::thread::scope(|scope| {
        scope.spawn(|| worker_b.run(&catalog, &models, &executor, &tensors, &peers));

        let stolen = poll_until(|| worker_a.queue_len() < 5, 100);
        assert!(stolen, "worker B should have stolen at least one job from A's backlog once its own queue drained");

        worker_b.kill();
    });

    // B reports back its own seed job plus every stolen job it went on to
    // finish (greedily, since A's queue never drops below 2 on its own).
    let mut completed = 0;
    while rx.try_recv().is_ok() {
        completed += 1;
    }
    assert!(completed >= 2, "B should have finished its seed job and at least one stolen job, got {completed}");
}

/// Two workers whose predicted post-invoke temperatures both stay under
/// their own throttling threshold: `ThermalAware` still prefers the cooler
/// of the two, independent of either worker's queue depth.
#[test]
fn thermal_aware_placement_prefers_the_cooler_of_two_safe_workers() {
    let mut readings = std::collections::HashMap::new();
    readings.insert("/worker0/temp".to_string(), 60.0);
    readings.insert("/worker1/temp".to_string(), 75.0);
    struct FixedReadings(std::collections::HashMap<String, f64>);
    impl ResourceSource for FixedReadings {
        fn read(&self, path: &str) -> Option<f64> {
            self.0.get(path).copied()
        }
    }
    let monitor = ResourceMonitor::new(
        Box::new(FixedReadings(readings)),
        vec![
            ResourceConfig { worker_id: 0, thermal_zone_path: Some("/worker0/temp".into()), target_zone_path: None, freq_path: None, throttling_threshold: 70.0 },
            ResourceConfig { worker_id: 1, thermal_zone_path: Some("/worker1/temp".into()), target_zone_path: None, freq_path: None, throttling_threshold: 80.0 },
        ],
    );
    let poller = monitor.spawn_poller(None);
    std::thread::sleep(Duration::from_millis(60));

    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0, 1], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();

    let mut models = ModelManager::new(Arc::clone(&monitor));
    // cpu_count matches the two workers registered in the monitor above,
    // since the thermal feature vector is built from its full reading set.
    models.register_worker(0, DeviceId::Cpu, 1, 2);
    models.register_worker(1, DeviceId::Cpu, 1, 2);

    let tensors = TensorRingBuffer::new(16);
    let placements: Arc<Mutex<Vec<WorkerId>>> = Arc::new(Mutex::new(Vec::new()));
    let worker0: Arc<dyn WorkerHandle> = Arc::new(RecordingWorker { id: 0, waiting: Duration::ZERO, placements: Arc::clone(&placements) });
    let worker1: Arc<dyn WorkerHandle> = Arc::new(RecordingWorker { id: 1, waiting: Duration::ZERO, placements: Arc::clone(&placements) });

    let planner = Planner::new(
        &[SchedulerId::ThermalAware],
        vec![(worker0, DeviceId::Cpu), (worker1, DeviceId::Cpu)],
        catalog,
        models,
        tensors,
        10,
        None,
    );

    let (_tx, rx) = crossbeam_channel::unbounded();
    let planner_thread = planner.spawn(CpuSet { cores: vec![] }, rx);
    planner.enqueue_request(Job::new(1, model_id, 0));

    let placed = poll_until(|| !placements.lock().unwrap().is_empty(), 100);
    assert!(placed, "the planner should have placed the job within the polling window");
    assert_eq!(placements.lock().unwrap().as_slice(), &[0], "the 60C worker is chosen over the 75C one despite both being under threshold");

    planner.shutdown();
    planner_thread.join().unwrap();
    monitor.shutdown();
    poller.join().unwrap();
}

/// The offloading scheduler routes every job to whichever registered worker
/// is bound to the cloud device, regardless of registration order.
#[test]
fn offloading_routes_every_job_to_the_cloud_worker() {
    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0, 1], SubgraphPreparationType::FallbackPerDevice, 1, None).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cpu, 0, 1);
    models.register_worker(1, DeviceId::Cloud, 0, 1);
    let tensors = TensorRingBuffer::new(16);

    let placements: Arc<Mutex<Vec<WorkerId>>> = Arc::new(Mutex::new(Vec::new()));
    let cpu_worker: Arc<dyn WorkerHandle> = Arc::new(RecordingWorker { id: 0, waiting: Duration::ZERO, placements: Arc::clone(&placements) });
    let cloud_worker: Arc<dyn WorkerHandle> = Arc::new(RecordingWorker { id: 1, waiting: Duration::ZERO, placements: Arc::clone(&placements) });

    let planner = Planner::new(
        &[SchedulerId::Offloading],
        vec![(cpu_worker, DeviceId::Cpu), (cloud_worker, DeviceId::Cloud)],
        catalog,
        models,
        tensors,
        10,
        None,
    );

    let (_tx, rx) = crossbeam_channel::unbounded();
    let planner_thread = planner.spawn(CpuSet { cores: vec![] }, rx);
    planner.enqueue_request(Job::new(1, model_id, 0));

    let placed = poll_until(|| !placements.lock().unwrap().is_empty(), 100);
    assert!(placed, "the planner should have placed the job within the polling window");
    assert_eq!(placements.lock().unwrap().as_slice(), &[1], "the job goes to worker 1, the one bound to the cloud device");

    planner.shutdown();
    planner_thread.join().unwrap();
}

/// After enough cloud round trips recorded through `update_cloud_latency`,
/// the predicted latency for a fresh `(input_bytes, output_bytes)` pair
/// converges to within 10% of the steady-state round trip the observations
/// were drawn from (50ms computation, 150ms communication).
#[test]
fn cloud_latency_prediction_converges_after_enough_round_trips() {
    let mut catalog = SubgraphCatalog::new();
    let model_id = catalog.register_model(trivial_spec(), &[0], SubgraphPreparationType::NoFallback, 1, None).unwrap();
    let sg_idx = catalog.subgraph_idx(model_id, 0).unwrap();

    let mut models = ModelManager::new(empty_monitor());
    models.register_worker(0, DeviceId::Cloud, 0, 1);

    for i in 0..200u64 {
        let mut subgraph = catalog.get(sg_idx).clone();
        subgraph.input_bytes = 1000 + ((i % 7) * 150) as usize;
        subgraph.output_bytes = 500 + ((i % 5) * 90) as usize;
        models.update_cloud_latency(0, &subgraph, Duration::from_millis(50), Duration::from_millis(150));
    }

    let mut probe = catalog.get(sg_idx).clone();
    probe.input_bytes = 2000;
    probe.output_bytes = 1000;
    let predicted = models.predicted_latency(0, &probe).as_micros() as f64;
    let target = 200_000.0;
    assert!((predicted - target).abs() / target < 0.10, "predicted={predicted}us, target={target}us");
}
