//! Allocator hook proving the delivery path never touches the heap.
//!
//! A counting global allocator tracks allocations made by this thread while
//! it pumps frames through the same code the device callback runs. Worker
//! and monitor threads may allocate on their own schedules; only the pumping
//! thread is tracked.

use chronus_engine::Engine;
use chronus_engine::supervisor::PatchOp;
use chronus_protocol::{EngineConfig, ModuleKind};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static TRACKED_ALLOCS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static TRACKING: Cell<bool> = const { Cell::new(false) };
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if TRACKING.with(|t| t.get()) {
            TRACKED_ALLOCS.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if TRACKING.with(|t| t.get()) {
            TRACKED_ALLOCS.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

#[test]
fn steady_state_delivery_makes_no_heap_allocations() {
    let mut cfg = EngineConfig::default();
    cfg.osc.port = 0;
    cfg.viz.enable = false;
    let mut engine = Engine::start_headless(cfg).expect("start");

    let supervisor = engine.engine.supervisor();
    supervisor.stage(PatchOp::Create {
        id: "osc1".into(),
        kind: ModuleKind::Sine,
    });
    supervisor.commit().expect("commit");
    supervisor.set_param("osc1", "gain", 0.5).expect("route");

    let mut data = vec![0.0f32; 256];
    let period = std::time::Duration::from_secs_f64(256.0 / 44100.0);

    // Reach steady state first; initialization may allocate freely.
    for _ in 0..20 {
        engine.delivery.fill_device_buffer(&mut data, 1);
        std::thread::sleep(period);
    }

    TRACKED_ALLOCS.store(0, Ordering::Relaxed);
    for _ in 0..50 {
        TRACKING.with(|t| t.set(true));
        engine.delivery.fill_device_buffer(&mut data, 1);
        TRACKING.with(|t| t.set(false));
        std::thread::sleep(period);
    }

    let allocs = TRACKED_ALLOCS.load(Ordering::Relaxed);
    assert_eq!(allocs, 0, "delivery path allocated {allocs} times");

    engine.engine.shutdown();
}
