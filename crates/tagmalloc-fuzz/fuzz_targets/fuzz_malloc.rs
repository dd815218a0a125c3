#![no_main]
use libfuzzer_sys::fuzz_target;

use tagmalloc_core::{MallocConfig, MallocContext};

// Interpret the input as an allocate/release/resize/usable-size script and
// require every live pointer to keep its stamped first byte.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let ctx = MallocContext::with_config(MallocConfig {
        byte_limit: 64 * 1024 * 1024,
        read_env: false,
        ..MallocConfig::default()
    });
    let t = ctx.thread();
    let mut live: Vec<(usize, u8)> = Vec::new();

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let stamp = chunk[3];

        match op {
            0 => {
                if let Ok(p) = t.malloc(size) {
                    assert_eq!(p % 16, 0);
                    // Even a zero-byte request owns a minimum-size chunk.
                    ctx.write_bytes(p, &[stamp]);
                    live.push((p, stamp));
                }
            }
            1 => {
                if let Some((p, stamp)) = live.pop() {
                    let mut b = [0u8; 1];
                    ctx.read_bytes(p, &mut b);
                    assert_eq!(b[0], stamp, "payload byte survived");
                    t.free(p);
                }
            }
            2 => {
                if let Some((p, stamp)) = live.pop() {
                    if let Ok(q) = t.realloc(p, size.max(1)) {
                        let mut b = [0u8; 1];
                        ctx.read_bytes(q, &mut b);
                        assert_eq!(b[0], stamp, "realloc preserved the prefix");
                        live.push((q, stamp));
                    }
                }
            }
            _ => {
                if let Some(&(p, _)) = live.last() {
                    let _ = t.usable_size(p);
                }
            }
        }
    }

    for (p, _) in live {
        t.free(p);
    }
});
