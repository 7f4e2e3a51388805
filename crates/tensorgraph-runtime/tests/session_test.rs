//! Whole-network sessions on the device, checked against host runs.

mod common;

use common::{assert_close, classifier_model, denoiser_model};
use tensorgraph_model::Model;
use tensorgraph_operators::CpuGraph;
use tensorgraph_runtime::stage::{StageBuffers, run_stages};
use tensorgraph_runtime::{
    GraphConfig, Image, ImageFormat, Network, Session, SessionConfig, SessionState, TensorDesc,
    networks,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn test_image(width: u32, height: u32) -> Image {
    Image::from_fn(width, height, |x, y| {
        let r = ((x * 7 + y * 3) % 64) as f32 / 63.0;
        let g = ((x ^ y) % 32) as f32 / 31.0;
        [r, g, 1.0 - r, 1.0]
    })
}

/// What the source texture holds after upload.
fn stored(image: &Image) -> Image {
    let bytes = image.to_bytes(ImageFormat::Rgba8Unorm);
    Image::from_bytes(image.width, image.height, ImageFormat::Rgba8Unorm, &bytes).unwrap()
}

/// Host run of `network` over `image`: (final activation values, presented pixels).
fn host_frame(network: &Network, model: &Model, image: &Image) -> (Vec<f32>, Option<Image>) {
    let mut graph = CpuGraph::new(GraphConfig::default()).unwrap();
    let weights_buffer = graph.create_buffer_bytes(&model.weights.to_bytes());
    let weights = model.bind(weights_buffer);

    let (tiles_x, tiles_y) = image.extent().tiles(network.tile, network.tile);
    let io = graph.create_buffer(1 << 20);
    let input = TensorDesc::with_size(io, network.tile, network.tile, network.channels, tiles_x * tiles_y);
    let scratch = [graph.create_buffer(1 << 22), graph.create_buffer(1 << 22)];

    graph
        .image_to_tensor(&input, image.extent(), &image.pixels)
        .unwrap();
    let output = run_stages(
        &network.stages,
        StageBuffers {
            input,
            output: input,
            weights: &weights,
            scratch,
        },
        &mut graph,
    )
    .unwrap();
    let values = graph.read(&output).unwrap();

    let presented = (output.buffer == Some(io)).then(|| {
        let pixels = graph.tensor_to_image(image.extent(), &output).unwrap();
        Image::from_pixels(image.width, image.height, pixels).unwrap()
    });
    (values, presented)
}

async fn session(network: Network, model: &Model) -> Session {
    let graph = common::graph(GraphConfig::default()).await;
    Session::new(graph, model, SessionConfig::new(network)).expect("session should build")
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_denoiser_frame_matches_host() {
    init_tracing();
    let model = denoiser_model(4);
    let mut session = session(networks::denoiser(), &model).await;
    assert_eq!(session.state(), SessionState::Idle);

    let image = test_image(128, 64);
    session.set_input(&image).unwrap();
    let report = session.advance().unwrap();

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(report.frame, 1);
    // Image load, twelve stages, presentation
    assert_eq!(report.dispatches, 14);

    let (expected, presented) = host_frame(&networks::denoiser(), &model, &stored(&image));
    let output = session.output_tensor().copied().unwrap();
    assert_eq!(output.buffer, Some(session.input_tensor().buffer.unwrap()));
    assert_close(&session.read_output_tensor().unwrap(), &expected, 1e-2);

    let actual = session.read_output_image().unwrap();
    let presented = presented.unwrap();
    assert_eq!((actual.width, actual.height), (128, 64));
    for (a, e) in actual.pixels.iter().zip(&presented.pixels) {
        for (a, e) in a.iter().zip(e) {
            assert!((a - e).abs() <= 2.0 / 255.0 + 1e-6, "pixel {a} vs {e}");
        }
    }
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_classifier_scores_every_tile() {
    init_tracing();
    let model = classifier_model();
    let mut session = session(networks::classifier(), &model).await;

    let image = test_image(84, 28);
    session.set_input(&image).unwrap();
    session.advance().unwrap();

    let logits = session.output_tensor().copied().unwrap();
    assert_eq!(logits.dims(), [1, 10, 1, 3]);
    let (expected, presented) = host_frame(&networks::classifier(), &model, &stored(&image));
    assert!(presented.is_none());
    assert_close(&session.read_output_tensor().unwrap(), &expected, 1e-3);

    let classes = session.classify().unwrap();
    assert_eq!(classes.len(), 3);
    assert!(classes.iter().all(|&c| c < 10));
    assert!(session.read_output_image().is_err());
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_resize_reallocates() {
    init_tracing();
    let model = denoiser_model(4);
    let mut session = session(networks::denoiser(), &model).await;

    session.set_input(&test_image(64, 64)).unwrap();
    session.advance().unwrap();
    let small = session.scratch_capacity();
    assert_eq!(session.input_tensor().layers, 1);

    // 200x130 keeps three by two whole tiles
    session.set_input(&test_image(200, 130)).unwrap();
    let report = session.advance().unwrap();
    assert_eq!(report.frame, 2);
    assert_eq!(session.input_tensor().layers, 6);
    assert_eq!(session.scratch_capacity(), small * 6);
    let image = session.read_output_image().unwrap();
    assert_eq!((image.width, image.height), (200, 130));

    // Same size again reuses the allocation
    session.set_input(&test_image(200, 130)).unwrap();
    assert_eq!(session.scratch_capacity(), small * 6);
    session.advance().unwrap();
    assert_eq!(session.frames(), 3);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_invalid_inputs_leave_session_idle() {
    let model = denoiser_model(4);
    let mut session = session(networks::denoiser(), &model).await;

    assert!(session.advance().is_err());
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.read_output_tensor().is_err());

    assert!(session.set_input(&test_image(32, 32)).is_err());
    assert_eq!(session.frames(), 0);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_model_missing_weights_fails_on_resize() {
    let model = classifier_model();
    let mut session = session(networks::denoiser(), &model).await;

    let err = session.set_input(&test_image(64, 64)).unwrap_err();
    assert!(err.to_string().contains("stage"), "{err}");
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_session_is_idle_between_frames() {
    let model = classifier_model();
    let mut session = session(networks::classifier(), &model).await;
    session.set_input(&test_image(56, 28)).unwrap();

    for frame in 1..=2 {
        let report = session.advance().unwrap();
        assert_eq!(report.frame, frame);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.classify().unwrap().len(), 2);
    }
    assert_eq!(session.frames(), 2);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_failed_resize_keeps_previous_resources() {
    let model = classifier_model();
    let mut session = session(networks::classifier(), &model).await;
    session.set_input(&test_image(56, 28)).unwrap();
    session.advance().unwrap();
    let input = *session.input_tensor();
    let capacity = session.scratch_capacity();

    // One tile wider than the largest texture the device accepts
    let limit = session.graph().device().limits().max_texture_dimension_2d;
    let err = session.set_input(&test_image(limit + 28, 28)).unwrap_err();
    assert!(err.to_string().contains("texture"), "{err}");

    assert_eq!(*session.input_tensor(), input);
    assert_eq!(session.scratch_capacity(), capacity);
    session.set_input(&test_image(56, 28)).unwrap();
    assert_eq!(session.advance().unwrap().frame, 2);
    assert_eq!(session.classify().unwrap().len(), 2);
}
