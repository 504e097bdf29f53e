//! End-to-end tests of the sampler over a scripted in-memory transport and a
//! scripted in-process table.
use replay_sampler::{
    ChunkData, ChunkSlice, Dtype, EncodedTensor, FlatTrajectory, ItemInfo, ReplayTable, Result,
    SampleInfo, SampleRequest, SampleResponse, SampleStream, SampledItem, Sampler, SamplerConfig,
    SamplerError, StreamClient, StreamHandle, Tensor, TensorSpec, TrajectoryColumn,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn f32_col(values: &[f32]) -> Tensor {
    Tensor::F32(
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[values.len(), 1]), values.to_vec())
            .expect("valid test shape"),
    )
}

fn f32_mat(rows: usize, cols: usize) -> Tensor {
    Tensor::F32(ndarray::ArrayD::from_shape_fn(
        ndarray::IxDyn(&[rows, cols]),
        |ix| (ix[0] * cols + ix[1]) as f32,
    ))
}

fn scalar_u64(tensor: &Tensor) -> u64 {
    match tensor {
        Tensor::U64(a) => *a.iter().next().expect("non-empty tensor"),
        other => panic!("expected a u64 tensor, got {:?}", other.dtype()),
    }
}

/// Builds the response burst for one item whose single column spans the
/// given `(chunk_key, rows)` chunks in order.
fn item_responses(key: u64, chunks: &[(u64, &[f32])]) -> Vec<SampleResponse> {
    let chunk_slices = chunks
        .iter()
        .map(|(chunk_key, rows)| ChunkSlice {
            chunk_key: *chunk_key,
            offset: 0,
            length: rows.len(),
            index: 0,
        })
        .collect();
    let info = SampleInfo {
        item: ItemInfo {
            key,
            priority: 1.5,
            trajectory: FlatTrajectory {
                columns: vec![TrajectoryColumn {
                    chunk_slices,
                    squeeze: false,
                }],
            },
        },
        probability: 0.25,
        table_size: 64,
    };

    let mut responses = vec![SampleResponse::from_info(info)];
    for (chunk_key, rows) in chunks {
        responses.push(SampleResponse::from_data(ChunkData {
            key: *chunk_key,
            tensors: vec![EncodedTensor::encode(&f32_col(rows))],
            delta_encoded: false,
        }));
    }
    responses
}

/// Scripted server shared by every stream a test opens.
struct ServerScript {
    /// Produces the responses of the `seq`-th item served.
    make_item: Box<dyn Fn(u64) -> Vec<SampleResponse> + Send + Sync>,
    /// Per-stream plan, in open order: break with `Unavailable` after this
    /// many items. Exhausted plans mean "serve forever".
    break_plan: Mutex<VecDeque<usize>>,
    streams_opened: AtomicUsize,
    item_seq: AtomicU64,
}

impl ServerScript {
    fn serving(make_item: impl Fn(u64) -> Vec<SampleResponse> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            make_item: Box::new(make_item),
            break_plan: Mutex::new(VecDeque::new()),
            streams_opened: AtomicUsize::new(0),
            item_seq: AtomicU64::new(0),
        })
    }

    fn with_break_plan(self: Arc<Self>, plan: &[usize]) -> Arc<Self> {
        *self.break_plan.lock().unwrap() = plan.iter().copied().collect();
        self
    }
}

struct FakeClient {
    script: Arc<ServerScript>,
}

impl StreamClient for FakeClient {
    fn open_stream(&self) -> (Box<dyn SampleStream>, Arc<dyn StreamHandle>) {
        self.script.streams_opened.fetch_add(1, Ordering::SeqCst);
        let break_after = self.script.break_plan.lock().unwrap().pop_front();
        let cancelled = Arc::new(AtomicBool::new(false));
        let stream = FakeStream {
            script: self.script.clone(),
            pending: VecDeque::new(),
            served: 0,
            break_after,
            broken: false,
            cancelled: cancelled.clone(),
        };
        (Box::new(stream), Arc::new(FakeHandle(cancelled)))
    }
}

struct FakeHandle(Arc<AtomicBool>);

impl StreamHandle for FakeHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct FakeStream {
    script: Arc<ServerScript>,
    pending: VecDeque<SampleResponse>,
    served: usize,
    break_after: Option<usize>,
    broken: bool,
    cancelled: Arc<AtomicBool>,
}

impl SampleStream for FakeStream {
    fn write(&mut self, request: SampleRequest) -> bool {
        if self.cancelled.load(Ordering::SeqCst) || self.broken {
            return false;
        }
        for _ in 0..request.num_samples {
            if Some(self.served) == self.break_after {
                self.broken = true;
                break;
            }
            let seq = self.script.item_seq.fetch_add(1, Ordering::SeqCst);
            self.pending.extend((self.script.make_item)(seq));
            self.served += 1;
        }
        true
    }

    fn read(&mut self) -> Option<SampleResponse> {
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        self.pending.pop_front()
    }

    fn finish(&mut self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SamplerError::cancelled("stream cancelled"))
        } else {
            Err(SamplerError::unavailable("stream broke"))
        }
    }
}

fn remote_sampler(
    script: &Arc<ServerScript>,
    config: &SamplerConfig,
    signature: Option<Vec<TensorSpec>>,
) -> Sampler {
    let client = Arc::new(FakeClient {
        script: script.clone(),
    });
    Sampler::new_remote(client, "experience", config, signature).unwrap()
}

fn one_worker_config(max_samples: usize) -> SamplerConfig {
    SamplerConfig {
        max_samples: Some(max_samples),
        max_in_flight_samples_per_worker: 1,
        num_workers: Some(1),
        ..Default::default()
    }
}

#[test]
fn single_item_spanning_two_chunks() {
    init_logger();
    let script = ServerScript::serving(|seq| {
        item_responses(seq, &[(7, &[0.0, 1.0]), (8, &[2.0, 3.0, 4.0])])
    });
    let sampler = remote_sampler(&script, &one_worker_config(1), None);

    let out = sampler.next_sample().unwrap();
    assert_eq!(out.len(), 5);
    // Metadata is broadcast along the five assembled timesteps.
    assert_eq!(out[0], Tensor::broadcast_u64(0, 5));
    assert_eq!(out[1], Tensor::broadcast_f64(0.25, 5));
    assert_eq!(out[2], Tensor::broadcast_i64(64, 5));
    assert_eq!(out[3], Tensor::broadcast_f64(1.5, 5));
    // Chunk 7's rows precede chunk 8's.
    assert_eq!(out[4], f32_col(&[0.0, 1.0, 2.0, 3.0, 4.0]));

    assert!(sampler.next_sample().unwrap_err().is_out_of_range());
}

#[test]
fn timestep_iteration_and_budget_exhaustion() {
    init_logger();
    let script = ServerScript::serving(|seq| {
        item_responses(seq, &[(7, &[0.0, 1.0]), (8, &[2.0, 3.0, 4.0])])
    });
    let sampler = remote_sampler(&script, &one_worker_config(1), None);

    for step in 0..5 {
        let (row, end_of_sample) = sampler.next_timestep().unwrap();
        assert_eq!(row.len(), 5);
        assert_eq!(scalar_u64(&row[0]), 0);
        assert_eq!(row[4], Tensor::F32(ndarray::ArrayD::from_elem(
            ndarray::IxDyn(&[1]),
            step as f32,
        )));
        assert_eq!(end_of_sample, step == 4, "step {}", step);
    }
    // The budget of one sample is spent; iterating further is out of range.
    assert!(sampler.next_timestep().unwrap_err().is_out_of_range());
}

#[test]
fn samples_arrive_from_all_workers() {
    init_logger();
    let script = ServerScript::serving(|seq| item_responses(seq, &[(100 + seq, &[1.0, 2.0])]));
    let config = SamplerConfig {
        max_samples: Some(20),
        max_in_flight_samples_per_worker: 2,
        num_workers: Some(3),
        max_samples_per_stream: Some(4),
        ..Default::default()
    };
    let sampler = remote_sampler(&script, &config, None);

    let mut keys = Vec::new();
    for _ in 0..20 {
        let out = sampler.next_trajectory().unwrap();
        keys.push(scalar_u64(&out[0]));
    }
    assert!(sampler.next_trajectory().unwrap_err().is_out_of_range());

    // Cross-worker order is arbitrary, but every item arrives exactly once.
    keys.sort_unstable();
    assert_eq!(keys, (0..20).collect::<Vec<u64>>());
}

#[test]
fn transient_stream_failure_is_retried() {
    init_logger();
    let script = ServerScript::serving(|seq| item_responses(seq, &[(7, &[1.0])]))
        .with_break_plan(&[2]);
    let config = SamplerConfig {
        max_samples: Some(5),
        max_in_flight_samples_per_worker: 5,
        num_workers: Some(1),
        ..Default::default()
    };
    let sampler = remote_sampler(&script, &config, None);

    // The first stream dies with `Unavailable` after two samples; the worker
    // must transparently reopen and finish the quota.
    for _ in 0..5 {
        sampler.next_trajectory().unwrap();
    }
    assert!(sampler.next_trajectory().unwrap_err().is_out_of_range());
    assert_eq!(script.streams_opened.load(Ordering::SeqCst), 2);
}

#[test]
fn protocol_violation_is_sticky() {
    init_logger();
    // The item declares two chunks, but the second arrives empty.
    let script = ServerScript::serving(|seq| {
        let mut responses = item_responses(seq, &[(7, &[1.0]), (8, &[2.0])]);
        responses[2] = SampleResponse::from_data(ChunkData {
            key: 8,
            tensors: vec![],
            delta_encoded: false,
        });
        responses
    });
    let sampler = remote_sampler(&script, &one_worker_config(10), None);

    let err = sampler.next_sample().unwrap_err();
    assert!(matches!(err, SamplerError::Internal(_)), "got {:?}", err);
    // The violation poisons the sampler for every later call.
    let again = sampler.next_sample().unwrap_err();
    assert!(matches!(again, SamplerError::Internal(_)), "got {:?}", again);
}

#[test]
fn cancellation_mid_stream() {
    init_logger();
    let script = ServerScript::serving(|seq| item_responses(seq, &[(7, &[1.0, 2.0])]));
    let config = SamplerConfig {
        max_samples: Some(1000),
        max_in_flight_samples_per_worker: 10,
        num_workers: Some(1),
        ..Default::default()
    };
    let sampler = remote_sampler(&script, &config, None);

    for _ in 0..250 {
        sampler.next_sample().unwrap();
    }
    sampler.close();

    let err = sampler.next_sample().unwrap_err();
    assert!(err.is_cancelled(), "got {:?}", err);
    // Nothing beyond the consumed samples and the bounded buffer was drawn
    // from the server.
    let served = script.item_seq.load(Ordering::SeqCst) as usize;
    assert!(served <= 250 + 10 + 1, "served {} items", served);
}

#[test]
fn signature_mismatch_names_index_and_table() {
    init_logger();
    let script = ServerScript::serving(|seq| {
        let info = SampleInfo {
            item: ItemInfo {
                key: seq,
                priority: 1.0,
                trajectory: FlatTrajectory {
                    columns: vec![TrajectoryColumn {
                        chunk_slices: vec![ChunkSlice {
                            chunk_key: 7,
                            offset: 0,
                            length: 3,
                            index: 0,
                        }],
                        squeeze: false,
                    }],
                },
            },
            probability: 0.5,
            table_size: 8,
        };
        vec![
            SampleResponse::from_info(info),
            SampleResponse::from_data(ChunkData {
                key: 7,
                tensors: vec![EncodedTensor::encode(&f32_mat(3, 5))],
                delta_encoded: false,
            }),
        ]
    });

    let mut signature = replay_sampler::metadata_specs();
    signature.push(TensorSpec {
        dtype: Dtype::F32,
        shape: Some(vec![Some(4)]),
    });
    let sampler = remote_sampler(&script, &one_worker_config(10), Some(signature));

    let err = sampler.next_sample().unwrap_err();
    match err {
        SamplerError::InvalidArgument(msg) => {
            assert!(msg.contains("flattened index 4"), "message was: {}", msg);
            assert!(msg.contains("table 'experience'"), "message was: {}", msg);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn concurrent_consumers_share_the_stream() {
    init_logger();
    let script = ServerScript::serving(|seq| item_responses(seq, &[(7, &[1.0])]));
    let config = SamplerConfig {
        max_samples: Some(10),
        max_in_flight_samples_per_worker: 2,
        num_workers: Some(2),
        ..Default::default()
    };
    let sampler = Arc::new(remote_sampler(&script, &config, None));

    let (key_tx, key_rx) = crossbeam_channel::unbounded();
    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let sampler = sampler.clone();
            let key_tx = key_tx.clone();
            thread::spawn(move || loop {
                match sampler.next_trajectory() {
                    Ok(out) => key_tx.send(scalar_u64(&out[0])).unwrap(),
                    Err(err) => {
                        assert!(err.is_out_of_range(), "got {:?}", err);
                        break;
                    }
                }
            })
        })
        .collect();
    drop(key_tx);

    let mut keys: Vec<u64> = key_rx.iter().collect();
    for consumer in consumers {
        consumer.join().unwrap();
    }
    keys.sort_unstable();
    assert_eq!(keys, (0..10).collect::<Vec<u64>>());
}

// ---------------------------------------------------------------------------
// Local table
// ---------------------------------------------------------------------------

/// Serves scripted items, then starves (sleeps through every timeout).
struct ScriptedTable {
    name: String,
    items: Mutex<VecDeque<SampledItem>>,
}

impl ScriptedTable {
    fn new(items: Vec<SampledItem>) -> Self {
        Self {
            name: "local".to_string(),
            items: Mutex::new(items.into()),
        }
    }
}

impl ReplayTable for ScriptedTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_flexible_batch(
        &self,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<SampledItem>> {
        let mut items = self.items.lock().unwrap();
        if items.is_empty() {
            drop(items);
            thread::sleep(timeout);
            return Err(SamplerError::deadline_exceeded("rate limiter timed out"));
        }
        let n = batch_size.min(items.len());
        Ok(items.drain(..n).collect())
    }

    fn default_flexible_batch_size(&self) -> usize {
        4
    }
}

fn table_item(key: u64, values: &[f32]) -> SampledItem {
    let chunk = Arc::new(ChunkData {
        key: 900 + key,
        tensors: vec![EncodedTensor::encode(&f32_col(values))],
        delta_encoded: false,
    });
    SampledItem {
        item: ItemInfo {
            key,
            priority: 2.0,
            trajectory: FlatTrajectory {
                columns: vec![TrajectoryColumn {
                    chunk_slices: vec![ChunkSlice {
                        chunk_key: 900 + key,
                        offset: 0,
                        length: values.len(),
                        index: 0,
                    }],
                    squeeze: false,
                }],
            },
        },
        probability: 0.125,
        table_size: 32,
        chunks: vec![chunk],
    }
}

#[test]
fn local_sampler_drains_the_table() {
    init_logger();
    let table = Arc::new(ScriptedTable::new(
        (0..6).map(|k| table_item(k, &[k as f32, k as f32 + 0.5])).collect(),
    ));
    let config = SamplerConfig {
        max_samples: Some(6),
        max_in_flight_samples_per_worker: 3,
        num_workers: Some(1),
        rate_limiter_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let sampler = Sampler::new_local(table, &config, None).unwrap();

    let mut keys = Vec::new();
    for _ in 0..6 {
        let out = sampler.next_trajectory().unwrap();
        assert_eq!(out[2], Tensor::scalar_i64(32));
        keys.push(scalar_u64(&out[0]));
    }
    keys.sort_unstable();
    assert_eq!(keys, (0..6).collect::<Vec<u64>>());
    assert!(sampler.next_trajectory().unwrap_err().is_out_of_range());
}

#[test]
fn local_worker_wakes_up_to_observe_cancellation() {
    init_logger();
    // The table never yields; the rate limiter timeout is far longer than
    // the test.
    let table = Arc::new(ScriptedTable::new(Vec::new()));
    let config = SamplerConfig {
        max_samples: Some(10),
        max_in_flight_samples_per_worker: 1,
        num_workers: Some(1),
        rate_limiter_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let sampler = Arc::new(Sampler::new_local(table, &config, None).unwrap());

    let consumer = {
        let sampler = sampler.clone();
        thread::spawn(move || sampler.next_sample())
    };

    thread::sleep(Duration::from_millis(500));
    let closing = Instant::now();
    sampler.close();
    // The blocked worker returns within one wake-up period, not after the
    // full 30 second rate limiter timeout.
    assert!(
        closing.elapsed() < Duration::from_secs(5),
        "close took {:?}",
        closing.elapsed()
    );

    let err = consumer.join().unwrap().unwrap_err();
    assert!(err.is_cancelled(), "got {:?}", err);
}
