#![no_main]
use libfuzzer_sys::fuzz_target;
use refalloc_core::backend::bounds_check;
use refalloc_core::{AllocatorType, Memory, memory};

/// A live block plus the references the fuzzer holds on it.
struct Live {
    mem: Memory,
    ty: AllocatorType,
    refs: i32,
    size: usize,
    fill: u8,
}

fn backend(selector: u8) -> AllocatorType {
    match selector % 4 {
        0 => AllocatorType::STANDARD,
        1 => AllocatorType::aligned(1 << (selector % 10)),
        2 => AllocatorType::BOUNDS_CHECK,
        _ => AllocatorType::debug(refalloc_core::debug_site!()),
    }
}

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk: [op, backend/slot, size lo, size hi].
    let mut live: Vec<Live> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let slot = chunk[1] as usize;
        let size = u16::from_le_bytes([chunk[2], chunk[3]]) as usize;

        match chunk[0] % 5 {
            0 => {
                let ty = backend(chunk[1]);
                if let Ok(mem) = memory::allocate(ty, size) {
                    // SAFETY: the block holds `size` user bytes.
                    unsafe { mem.as_mut_slice(size).fill(chunk[2]) };
                    live.push(Live { mem, ty, refs: 1, size, fill: chunk[2] });
                }
            }
            1 if !live.is_empty() => {
                let entry = &mut live[slot % live.len()];
                // SAFETY: the fuzzer holds at least one reference.
                unsafe { memory::retain(entry.mem) };
                entry.refs += 1;
            }
            2 if !live.is_empty() => {
                let index = slot % live.len();
                let entry = &mut live[index];
                // SAFETY: the fuzzer holds at least one reference.
                let count = unsafe { memory::ref_count(entry.mem) };
                assert_eq!(count, entry.refs);
                // SAFETY: dropping one held reference.
                unsafe { memory::deallocate(entry.mem) };
                entry.refs -= 1;
                if entry.refs == 0 {
                    live.swap_remove(index);
                }
            }
            3 if !live.is_empty() => {
                let index = slot % live.len();
                let entry = &mut live[index];
                if entry.refs != 1 {
                    continue;
                }
                // SAFETY: sole reference; resize replaces the block.
                if let Ok(mem) = unsafe { memory::reallocate(entry.ty, Some(entry.mem), size) } {
                    let kept = entry.size.min(size);
                    // SAFETY: the first `kept` bytes survive the resize.
                    let bytes = unsafe { mem.as_mut_slice(kept) };
                    assert!(bytes.iter().all(|&b| b == entry.fill));
                    entry.mem = mem;
                    entry.size = size;
                    // SAFETY: the block now holds `size` user bytes.
                    unsafe { mem.as_mut_slice(size).fill(entry.fill) };
                }
            }
            4 if !live.is_empty() => {
                let entry = &live[slot % live.len()];
                if entry.ty.index() == AllocatorType::BOUNDS_CHECK.index() {
                    // SAFETY: the fuzzer holds at least one reference.
                    assert!(unsafe { bounds_check::guards_intact(entry.mem) });
                }
            }
            _ => {}
        }
    }

    for entry in live {
        for _ in 0..entry.refs {
            // SAFETY: releasing every reference still held.
            unsafe { memory::deallocate(entry.mem) };
        }
    }
});
