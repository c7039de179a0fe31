use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use refalloc_core::backend::static_alloc;
use refalloc_core::{AllocError, AllocatorType, HEADER_SIZE, Memory, UNMANAGED_REF_COUNT, memory};

static DESTROYED: AtomicUsize = AtomicUsize::new(0);
static LAST_DESTROYED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn count_destroy(ptr: *mut c_void) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
    LAST_DESTROYED.store(ptr as usize, Ordering::SeqCst);
}

static CONCURRENT_DESTROYED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn concurrent_destroy(_ptr: *mut c_void) {
    CONCURRENT_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn noop_destroy(_ptr: *mut c_void) {}

#[test]
fn sixty_four_bytes_retained_twice_released_three_times() {
    let mem = memory::allocate(AllocatorType::STANDARD, 64).expect("alloc");
    assert_eq!(mem.addr() % std::mem::align_of::<usize>(), 0);

    // SAFETY: mem is live and owned by this test until the last release.
    unsafe {
        mem.as_mut_slice(64).fill(0xAB);
        let before = DESTROYED.load(Ordering::SeqCst);
        assert!(memory::set_destructor(mem, Some(count_destroy)).is_none());

        assert_eq!(memory::retain(mem), mem);
        assert_eq!(memory::retain(mem), mem);
        assert_eq!(memory::ref_count(mem), 3);

        memory::deallocate(mem);
        memory::deallocate(mem);
        assert_eq!(memory::ref_count(mem), 1);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before);
        assert!(mem.as_mut_slice(64).iter().all(|&b| b == 0xAB));

        memory::deallocate(mem);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
        assert_eq!(LAST_DESTROYED.load(Ordering::SeqCst), mem.addr());
    }
}

#[test]
fn set_destructor_returns_previous() {
    let mem = memory::allocate(AllocatorType::STANDARD, 8).expect("alloc");
    // SAFETY: mem is live and owned here.
    unsafe {
        assert!(memory::set_destructor(mem, Some(noop_destroy)).is_none());
        let previous = memory::set_destructor(mem, None).expect("previous destructor");
        assert_eq!(previous as usize, noop_destroy as usize);
        memory::deallocate(mem);
    }
}

#[test]
fn reallocate_none_allocates() {
    // SAFETY: no existing block.
    let mem = unsafe { memory::reallocate(AllocatorType::STANDARD, None, 24) }.expect("alloc");
    // SAFETY: mem is live.
    unsafe {
        assert_eq!(memory::ref_count(mem), 1);
        memory::deallocate(mem);
    }
}

#[test]
fn reallocate_keeps_header_and_contents() {
    let mem = memory::allocate(AllocatorType::STANDARD, 16).expect("alloc");
    // SAFETY: mem is live and exclusively owned.
    unsafe {
        mem.as_mut_slice(16).copy_from_slice(&[7u8; 16]);
        memory::set_destructor(mem, Some(noop_destroy));
        memory::retain(mem);

        // The selector's backend is ignored; the header decides.
        let grown = memory::reallocate(AllocatorType::BOUNDS_CHECK, Some(mem), 4096).expect("grow");
        assert_eq!(memory::ref_count(grown), 2);
        assert_eq!(grown.as_mut_slice(16), &[7u8; 16]);
        memory::deallocate(grown);
        memory::deallocate(grown);
    }
}

#[test]
fn reallocate_overflow_leaves_block_alone() {
    let mem = memory::allocate(AllocatorType::STANDARD, 16).expect("alloc");
    // SAFETY: mem is live.
    unsafe {
        let err = memory::reallocate(AllocatorType::STANDARD, Some(mem), usize::MAX - 1)
            .expect_err("overflow");
        assert!(matches!(err, AllocError::SizeOverflow { .. }));
        assert_eq!(memory::ref_count(mem), 1);
        memory::deallocate(mem);
    }
}

#[test]
fn largest_size_that_fits_the_header_reaches_the_backend() {
    let err = memory::allocate(AllocatorType::STANDARD, usize::MAX - HEADER_SIZE)
        .expect_err("host cannot satisfy this");
    assert!(matches!(err, AllocError::BackendFailed { index: 1, .. }));
}

#[test]
fn retain_and_release_balance_across_threads() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 1_000;

    let mem = memory::allocate(AllocatorType::STANDARD, 32).expect("alloc");
    // SAFETY: mem is live for the whole test.
    unsafe { memory::set_destructor(mem, Some(concurrent_destroy)) };
    let before = CONCURRENT_DESTROYED.load(Ordering::SeqCst);

    // Each thread gets its own reference up front.
    for _ in 0..THREADS {
        // SAFETY: the initial reference keeps mem live.
        unsafe { memory::retain(mem) };
    }
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    // SAFETY: this thread holds a reference throughout.
                    unsafe {
                        memory::retain(mem);
                        memory::deallocate(mem);
                    }
                }
                // SAFETY: drop this thread's own reference.
                unsafe { memory::deallocate(mem) };
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    // SAFETY: the test's original reference is still held.
    unsafe {
        assert_eq!(memory::ref_count(mem), 1);
        assert_eq!(CONCURRENT_DESTROYED.load(Ordering::SeqCst), before);
        memory::deallocate(mem);
    }
    assert_eq!(CONCURRENT_DESTROYED.load(Ordering::SeqCst), before + 1);
}

#[test]
fn last_release_wins_race_exactly_once() {
    static RACE_DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe extern "C" fn race_destroy(_ptr: *mut c_void) {
        RACE_DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    for _ in 0..50 {
        let before = RACE_DESTROYED.load(Ordering::SeqCst);
        let mem = memory::allocate(AllocatorType::STANDARD, 8).expect("alloc");
        // SAFETY: mem is live; every thread below owns exactly one reference.
        unsafe {
            memory::set_destructor(mem, Some(race_destroy));
            for _ in 0..3 {
                memory::retain(mem);
            }
        }
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    // SAFETY: drops this thread's single reference.
                    unsafe { memory::deallocate(mem) };
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(RACE_DESTROYED.load(Ordering::SeqCst), before + 1);
    }
}

#[test]
fn static_block_is_counted_but_never_freed() {
    static STATIC_DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe extern "C" fn static_destroy(_ptr: *mut c_void) {
        STATIC_DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    let mut storage = vec![0u64; 32];
    // SAFETY: storage outlives every use of mem.
    unsafe {
        let bytes = std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), 256);
        let mem = static_alloc::managed_block(bytes).expect("fits");
        let capacity = static_alloc::capacity(mem);
        assert_eq!(capacity, 256 - std::mem::size_of::<usize>() - HEADER_SIZE);

        let same = memory::reallocate(AllocatorType::STATIC, Some(mem), capacity).expect("fits");
        assert_eq!(same, mem);
        assert!(matches!(
            memory::reallocate(AllocatorType::STATIC, Some(mem), capacity + 1),
            Err(AllocError::BackendFailed { index: 0, .. })
        ));

        memory::set_destructor(mem, Some(static_destroy));
        memory::retain(mem);
        memory::deallocate(mem);
        memory::deallocate(mem);
        assert_eq!(STATIC_DESTROYED.load(Ordering::SeqCst), 1);
        // Storage still belongs to us and is still readable.
        assert_eq!(memory::ref_count(mem), 0);
    }
    drop(storage);
}

#[test]
fn unmanaged_storage_reports_saturated_count() {
    let mut storage = [0u64; 8];
    // SAFETY: storage outlives mem.
    unsafe {
        let bytes = std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), 64);
        let mem = static_alloc::unmanaged_block(bytes).expect("fits");
        for _ in 0..5 {
            memory::deallocate(mem);
        }
        assert_eq!(memory::ref_count(mem), UNMANAGED_REF_COUNT);
    }
}

#[test]
#[should_panic(expected = "over released")]
fn over_release_is_fatal() {
    let mut storage = [0u64; 8];
    // SAFETY: the static backend leaves storage readable after the last release.
    unsafe {
        let bytes = std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), 64);
        let mem = static_alloc::managed_block(bytes).expect("fits");
        memory::retain(mem);
        memory::deallocate(mem);
        memory::deallocate(mem);
        memory::deallocate(mem);
    }
}

#[test]
fn memory_handle_wraps_raw_pointers() {
    let mem = memory::allocate(AllocatorType::STANDARD, 4).expect("alloc");
    let again = Memory::from_raw(mem.as_ptr()).expect("non-null");
    assert_eq!(again, mem);
    assert_eq!(format!("{mem:p}"), format!("{:p}", mem.as_ptr()));
    // SAFETY: mem is live.
    unsafe { memory::deallocate(again) };
}
