use std::time::Duration;

use twincam::capture::{PixelFormat, SyntheticCamera};
use twincam::display::{DisplayPlane, VirtualCard};
use twincam::pipeline::{HandoffPipeline, PipelineOptions, PipelineState};
use twincam::Error;

fn plane(card: VirtualCard) -> DisplayPlane<VirtualCard> {
    let (connector, pipe) = (card.connector_id(), card.pipe_id());
    DisplayPlane::bind(card, connector, pipe).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synthetic_frames_reach_the_virtual_display() {
    let camera = SyntheticCamera::new(320, 240, PixelFormat::Xrgb8888, Some(200));
    let card = VirtualCard::new(640, 480, 240).unwrap();
    let options = PipelineOptions {
        frame_limit: Some(20),
        ..Default::default()
    };
    let mut pipeline = HandoffPipeline::setup(camera, plane(card), options).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), pipeline.run())
        .await
        .expect("pipeline did not finish")
        .unwrap();

    assert_eq!(stats.completions, 20);
    assert!(stats.commits >= 1);
    assert_eq!(stats.rejected, 0);
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    let census = pipeline.census();
    assert_eq!(census.total(), 4);
    assert_eq!(census.free, 4);
}

#[tokio::test]
async fn unplugged_camera_stops_with_disconnected() {
    let camera = SyntheticCamera::new(320, 240, PixelFormat::Yuyv, None);
    let trigger = camera.trigger();
    let options = PipelineOptions {
        drain_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let mut pipeline =
        HandoffPipeline::setup(camera, plane(VirtualCard::manual(640, 480)), options).unwrap();

    trigger.disconnect();
    let result = tokio::time::timeout(Duration::from_secs(5), pipeline.run())
        .await
        .expect("pipeline did not finish");

    assert!(matches!(result, Err(Error::Disconnected(_))));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.census().free, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handle_stops_a_free_running_pipeline() {
    let camera = SyntheticCamera::new(320, 240, PixelFormat::Nv12, Some(120));
    let card = VirtualCard::new(1280, 720, 60).unwrap();
    let mut pipeline =
        HandoffPipeline::setup(camera, plane(card), PipelineOptions::default()).unwrap();

    let handle = pipeline.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop();
    });

    let stats = tokio::time::timeout(Duration::from_secs(10), pipeline.run())
        .await
        .expect("pipeline did not stop")
        .unwrap();

    assert!(stats.completions > 0);
    assert!(stats.flips <= stats.commits);
    assert_eq!(pipeline.census().free, 4);
}
