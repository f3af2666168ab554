use partial_mlp::{
    Activation, Gym, LayerDescription, MemoryError, MemoryReport, MemoryTracker, Model, Sample,
    Topology, TrainConfig,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wide_model() -> Model {
    let topology = Topology::new(
        8,
        vec![
            LayerDescription::new(16, Activation::Relu),
            LayerDescription::new(16, Activation::Relu),
            LayerDescription::new(4, Activation::Linear),
        ],
    );
    let mut model = Model::zeroed(topology).unwrap();
    model.randomize_params(-0.5..0.5);
    model
}

fn dataset() -> Vec<([f32; 8], [f32; 4])> {
    (0..8)
        .map(|k| {
            let t = k as f32 / 8.0;
            ([t; 8], [t, 1.0 - t, 0.0, 1.0])
        })
        .collect()
}

#[test]
fn training_releases_every_block() {
    init_logger();
    let data = dataset();
    let samples: Vec<Sample> = data.iter().map(|(x, y)| (&x[..], &y[..])).collect();
    let mut model = wide_model();
    let tracker = MemoryTracker::new();
    let mut gym = Gym::new(&mut model, &tracker, TrainConfig::default());
    gym.train_batch(&samples).unwrap();
    gym.train_layer(&samples, 1).unwrap();
    gym.train_partial_layer(&samples, 0, 3, 2).unwrap();
    gym.train_batch_parallel(&samples, 2).unwrap();

    let report = tracker.report();
    assert_eq!(report.occupied_blocks, 0);
    assert_eq!(report.total_allocated, report.total_freed);
    assert!(report.num_blocks > 0);
    assert!(report.peak_allocated > 0);
    tracker.reset().unwrap();
    assert_eq!(tracker.report(), MemoryReport::default());
}

#[test]
fn partial_path_peaks_below_full_path() {
    init_logger();
    let data = dataset();
    let samples: Vec<Sample> = data.iter().map(|(x, y)| (&x[..], &y[..])).collect();

    let mut model = wide_model();
    let full = MemoryTracker::new();
    Gym::new(&mut model, &full, TrainConfig::default())
        .train_batch(&samples)
        .unwrap();
    let partial = MemoryTracker::new();
    Gym::new(&mut model, &partial, TrainConfig::default())
        .train_partial_layer(&samples, 2, 4, 0)
        .unwrap();

    let full_peak = full.report().peak_allocated;
    let partial_peak = partial.report().peak_allocated;
    assert!(partial_peak < full_peak, "{partial_peak} >= {full_peak}");
}

#[test]
fn live_buffers_block_reset() {
    init_logger();
    let model = wide_model();
    let tracker = MemoryTracker::new();
    let output = model.predict(&[0.5; 8], &tracker);
    let before = tracker.report();
    assert_eq!(tracker.reset(), Err(MemoryError::BlocksInUse { occupied: 1 }));
    assert_eq!(tracker.report(), before);
    drop(output);
    assert!(tracker.reset().is_ok());
}

#[test]
fn invalid_free_is_reported() {
    init_logger();
    let tracker = MemoryTracker::new();
    let buf = tracker.alloc_zeroed::<f32>(4);
    let addr = buf.as_ptr() as usize;
    assert!(matches!(
        tracker.record_free(addr + 1),
        Err(MemoryError::InvalidFree { .. })
    ));
    assert_eq!(tracker.report().occupied_blocks, 1);
    drop(buf);
    assert_eq!(tracker.report().occupied_blocks, 0);
    assert_eq!(
        tracker.record_free(addr),
        Err(MemoryError::InvalidFree { addr })
    );
}

#[test]
fn report_prints_every_counter() {
    let tracker = MemoryTracker::new();
    let _buf = tracker.alloc_zeroed::<u8>(10);
    let text = tracker.report().to_string();
    assert!(text.contains("Peak allocated memory: 10 bytes"));
    assert!(text.contains("Total blocks still being used: 1"));
}
