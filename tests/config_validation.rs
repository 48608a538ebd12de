use std::ffi::{CStr, CString};

use vermilion::kernel::{FrameKernel, FrameResult, KernelConfig, KernelError, RenderStage, StageContext};

struct NopStage;

impl RenderStage for NopStage {
    fn build_commands(&mut self, _: &StageContext) -> bool {
        true
    }

    fn on_resize(&mut self, _: &StageContext) -> bool {
        true
    }
}

fn test_config() -> KernelConfig {
    KernelConfig::new(
        CString::new("Vermilion Test").unwrap(),
        CString::new("Vermilion").unwrap(),
        800,
        600,
    )
}

#[test]
fn kernel_rejects_empty_extension_list() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut kernel = FrameKernel::new(test_config());
    match kernel.pre_init() {
        Err(KernelError::Instance(_)) => {}
        other => panic!("Expected a configuration error, got {:?}", other),
    }
    assert!(!kernel.has_errors());
}

#[test]
fn kernel_rejects_validation_without_layers() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = test_config();
    config.add_instance_extension(CStr::from_bytes_with_nul(b"VK_KHR_surface\0").unwrap());
    config.enable_validation = true;

    let mut kernel = FrameKernel::new(config);
    assert!(kernel.pre_init().is_err());
}

#[test]
fn frame_calls_fail_before_post_init() {
    let mut kernel = FrameKernel::new(test_config());

    assert_eq!(kernel.prepare_frame(), FrameResult::Error);
    assert_eq!(kernel.submit_frame(&[]), FrameResult::Error);

    match kernel.resize_window(&mut NopStage) {
        Err(KernelError::InvalidPhase) => {}
        other => panic!("Expected InvalidPhase, got {:?}", other),
    }
}

#[test]
fn resize_signal_crosses_threads() {
    let kernel = FrameKernel::new(test_config());
    let signal = kernel.get_resize_signal();

    let handle = std::thread::spawn(move || {
        signal.set_size(1920, 1080);
    });
    handle.join().unwrap();
}
