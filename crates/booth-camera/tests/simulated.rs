use booth_camera::{
    event_channel, CameraDriver, CameraError, CameraHandle, Capabilities, DeviceEvent, Property,
    PropertyId, SimulatedDriver,
};
use tokio_stream::StreamExt;

#[tokio::test]
async fn discover_open_configure() {
    let driver = SimulatedDriver::new().with_unsupported(PropertyId::WhiteBalance);
    let devices = driver.discover().await.unwrap();
    assert_eq!(devices.len(), 1);

    let cam = driver.open(&devices[0]).await.unwrap();
    assert_eq!(cam.capabilities(), Capabilities::ALL);

    let report = cam.configure(&Property::kiosk_defaults()).await.unwrap();
    assert_eq!(report.applied, vec![PropertyId::SaveTo, PropertyId::ImageQuality]);
    assert_eq!(report.rejected.len(), 1);
    assert!(matches!(
        report.rejected[0].1,
        CameraError::UnsupportedProperty(PropertyId::WhiteBalance)
    ));
    assert_eq!(driver.applied_properties().len(), 2);
}

#[tokio::test]
async fn open_failures_are_counted_down() {
    let driver = SimulatedDriver::new();
    driver.fail_opens(2);
    let desc = SimulatedDriver::descriptor(0);

    assert!(matches!(driver.open(&desc).await, Err(CameraError::OpenFailed { .. })));
    assert!(matches!(driver.open(&desc).await, Err(CameraError::OpenFailed { .. })));
    assert!(driver.open(&desc).await.is_ok());
    assert_eq!(driver.open_calls(), 3);
    assert_eq!(driver.open_handles(), 1);
}

#[tokio::test]
async fn missing_body_reports_no_device() {
    let driver = SimulatedDriver::new().with_no_devices();
    assert!(driver.discover().await.unwrap().is_empty());
    let err = driver.open(&SimulatedDriver::descriptor(0)).await.err().unwrap();
    assert!(matches!(err, CameraError::NoDevice));
}

#[tokio::test]
async fn preview_frames_and_injected_errors() {
    let driver = SimulatedDriver::new();
    let cam = driver.open(&SimulatedDriver::descriptor(0)).await.unwrap();

    // nothing before live view starts
    assert!(cam.poll_preview_frame().await.unwrap().is_none());

    cam.start_preview().await.unwrap();
    let first = cam.poll_preview_frame().await.unwrap().unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(&first.jpeg[..2], &[0xFF, 0xD8]);

    driver.fail_polls(1, false);
    driver.fail_polls(1, true);
    assert!(matches!(cam.poll_preview_frame().await, Err(CameraError::Transient(_))));
    assert!(matches!(cam.poll_preview_frame().await, Err(CameraError::Fatal(_))));
    assert_eq!(cam.poll_preview_frame().await.unwrap().unwrap().sequence, 2);
}

#[tokio::test]
async fn preview_unsupported_without_capability() {
    let driver = SimulatedDriver::new().with_capabilities(Capabilities {
        preview: false,
        ..Capabilities::ALL
    });
    let cam = driver.open(&SimulatedDriver::descriptor(0)).await.unwrap();
    assert!(matches!(cam.start_preview().await, Err(CameraError::Unsupported(_))));
}

#[tokio::test]
async fn capture_raises_both_notifications_for_one_asset() {
    let dir = tempfile::tempdir().unwrap();
    let driver = SimulatedDriver::new();
    let cam = driver.open(&SimulatedDriver::descriptor(0)).await.unwrap();
    let (sink, mut events) = event_channel(8);
    cam.register_event_sink(sink);

    cam.trigger_capture().await.unwrap();

    let created = events.next().await.unwrap();
    let requested = events.next().await.unwrap();
    assert!(matches!(created, DeviceEvent::FileCreated(_)));
    assert!(matches!(requested, DeviceEvent::DownloadRequested(_)));
    let a = created.asset().unwrap();
    let b = requested.asset().unwrap();
    assert_eq!(a.id(), b.id());

    let path = a.download_to(dir.path()).await.unwrap();
    assert_eq!(path.file_name().unwrap(), "IMG_0001.JPG");
    assert!(path.exists());
}

#[tokio::test]
async fn broken_download_and_fault_injection() {
    let dir = tempfile::tempdir().unwrap();
    let driver = SimulatedDriver::new().with_duplicate_notifications(false);
    let cam = driver.open(&SimulatedDriver::descriptor(0)).await.unwrap();
    let (sink, mut events) = event_channel(8);
    cam.register_event_sink(sink);

    driver.fail_downloads(true);
    cam.trigger_capture().await.unwrap();
    let event = events.next().await.unwrap();
    assert!(event.asset().unwrap().download_to(dir.path()).await.is_err());

    assert!(driver.inject_fault("usb reset"));
    assert!(matches!(events.next().await, Some(DeviceEvent::Fault(_))));
}

#[tokio::test]
async fn close_is_idempotent_and_invalidates_handle() {
    let driver = SimulatedDriver::new();
    let cam = driver.open(&SimulatedDriver::descriptor(0)).await.unwrap();
    let (sink, _events) = event_channel(4);
    cam.register_event_sink(sink);

    cam.close().await.unwrap();
    cam.close().await.unwrap();
    assert_eq!(driver.close_calls(), 1);
    assert_eq!(driver.close_requests(), 2);
    assert_eq!(driver.open_handles(), 0);
    assert!(!driver.has_sink());
    assert!(matches!(cam.trigger_capture().await, Err(CameraError::NotOpen)));
}
