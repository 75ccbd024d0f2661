#![no_main]

use tamp::{Handle, Tamp};

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate a block of size % 999 + 1 and token its payload
    Alloc { size: u16 },
    /// Increment the ith live handle's count
    Incref { index: u8 },
    /// Decrement the ith live handle's count, dropping it at zero
    Decref { index: u8 },
    /// Unconditionally release the ith live handle
    Free { index: u8 },
    /// Compact the heap, then verify every live payload
    Compact,
}
use Actions::*;

fn check_payload(tamp: &Tamp, handle: Handle, token: u8) {
    assert!(tamp.bytes(handle).iter().all(|&x| x == token));
}

fuzz_target!(|actions: Vec<Actions>| {
    let mut tamp = Tamp::new(8192);

    // (handle, payload token, expected count)
    let mut live: Vec<(Handle, u8, u32)> = vec![];

    for action in actions {
        match action {
            Alloc { size } => {
                let size = size as u32 % 999 + 1;

                if let Some(handle) = tamp.alloc(size) {
                    assert!(tamp.size_of(handle) == size);
                    assert!(tamp.refcount_of(handle) == 1);

                    let token = handle.index() as u8;
                    tamp.bytes_mut(handle).fill(token);
                    live.push((handle, token, 1));
                }
            }
            Incref { index } => {
                if index as usize >= live.len() { continue; }

                let (handle, _, count) = &mut live[index as usize];
                tamp.incref(*handle);
                *count = count.saturating_add(1);
                assert!(tamp.refcount_of(*handle) == *count);
            }
            Decref { index } => {
                if index as usize >= live.len() { continue; }

                let (handle, token, count) = live[index as usize];
                check_payload(&tamp, handle, token);

                let alive = tamp.decref(handle);
                assert!(alive == (count > 1));
                if alive {
                    live[index as usize].2 = count - 1;
                } else {
                    live.swap_remove(index as usize);
                }
            }
            Free { index } => {
                if index as usize >= live.len() { continue; }

                let (handle, token, _) = live.swap_remove(index as usize);
                check_payload(&tamp, handle, token);
                tamp.free(handle);
            }
            Compact => {
                tamp.compact();

                assert!(tamp.pool().counters().free_blocks <= 1);
                for &(handle, token, count) in &live {
                    check_payload(&tamp, handle, token);
                    assert!(tamp.refcount_of(handle) == count);
                }
            }
        }

        tamp.pool().integrity_check().unwrap();
    }
});
