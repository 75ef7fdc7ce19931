//! End-to-end tests: a real manager on a private socket, clients talking to it
//! over the wire, segments mapped from POSIX shared memory.
//!
//! Every test spawns its own [`Manager`] so tests can run in parallel. Tests
//! skip with a message when POSIX shared memory is unavailable.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=shmgr=debug cargo test --features tracing --test segments -- --nocapture
//! ```

use std::ffi::c_void;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use shmgr::client::ShmContext;
use shmgr::error::ShmError;
use shmgr::manager::{Manager, ManagerConfig};
use shmgr::protocol::{HEADER_SIZE, SERVICE_ID, Subtype, class, decode_reply};
use shmgr::types::{AttachFlags, ControlCommand, GetFlags, Key, SegmentStat, mode};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        shmgr::init_tracing();
    });
}

fn unique_socket(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    std::env::temp_dir().join(format!(
        "shmgr-it-{tag}-{}-{}.sock",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn spawn_manager(tag: &str) -> Manager {
    init_test_tracing();
    let config = ManagerConfig {
        socket_path: unique_socket(tag),
        max_segments: 64,
        grow_increment: 8,
        ..ManagerConfig::default()
    };
    Manager::spawn(config).expect("spawn manager")
}

fn create() -> GetFlags {
    GetFlags::CREATE.with_mode(0o600)
}

/// Skips the test when the manager cannot create backing objects here.
macro_rules! require_shm {
    ($name:literal, $ctx:expr) => {
        match $ctx.get(Key::PRIVATE, 1, create()) {
            Ok(probe) => $ctx.remove(probe).expect("remove probe"),
            Err(err) => {
                eprintln!("Skipping {}: POSIX shm unavailable ({err})", $name);
                return;
            }
        }
    };
}

/// Backing objects currently present for a manager instance, or `None` when
/// `/dev/shm` cannot be listed.
fn backing_objects(instance: u32) -> Option<usize> {
    let prefix = format!("shmgr-{instance:08x}-");
    let entries = std::fs::read_dir("/dev/shm").ok()?;
    Some(
        entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .count(),
    )
}

fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}

unsafe fn write_u64(addr: NonNull<c_void>, value: u64) {
    unsafe { addr.cast::<u64>().as_ptr().write_volatile(value) };
}

unsafe fn read_u64(addr: NonNull<c_void>) -> u64 {
    unsafe { addr.cast::<u64>().as_ptr().read_volatile() }
}

#[test]
fn two_clients_share_one_segment() {
    let manager = spawn_manager("share");
    let a = ShmContext::connect_to(manager.socket_path());
    let b = ShmContext::connect_to(manager.socket_path());
    require_shm!("two_clients_share_one_segment", a);

    let id = a.get(Key::new(42), 4096, create()).unwrap();
    assert_eq!(b.get(Key::new(42), 4096, create()).unwrap(), id);
    assert_eq!(backing_objects(manager.instance()).unwrap_or(1), 1);

    let at_a = a.attach(id, None, AttachFlags::empty()).unwrap();
    assert_eq!(a.stat(id).unwrap().nattch, 1);
    let at_b = b.attach(id, None, AttachFlags::RDONLY).unwrap();
    assert_eq!(b.stat(id).unwrap().nattch, 2);

    unsafe { write_u64(at_a, 0xfeed) };
    assert_eq!(unsafe { read_u64(at_b) }, 0xfeed);

    a.detach(at_a.as_ptr()).unwrap();
    assert_eq!(a.stat(id).unwrap().nattch, 1);

    // Removal does not pull the mapping out from under B.
    let old_seq = b.stat(id).unwrap().perm.seq;
    b.remove(id).unwrap();
    assert_eq!(unsafe { read_u64(at_b) }, 0xfeed);
    assert_eq!(a.stat(id), Err(ShmError::InvalidArgument));
    assert_eq!(backing_objects(manager.instance()).unwrap_or(0), 0);

    b.detach(at_b.as_ptr()).unwrap();
    assert_eq!(b.attached_count(), 0);

    // The key is free again: a new segment, in a new slot or with a new sequence.
    let fresh = a.get(Key::new(42), 4096, create()).unwrap();
    let stat = a.stat(fresh).unwrap();
    assert!(fresh != id || stat.perm.seq != old_seq);
    assert_eq!(stat.nattch, 0);

    manager.shutdown();
}

#[test]
fn shutdown_unlinks_backing_objects() {
    let manager = spawn_manager("unlink");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("shutdown_unlinks_backing_objects", ctx);

    for key in 1..=3 {
        ctx.get(Key::new(key), 4096, create()).unwrap();
    }
    ctx.get(Key::PRIVATE, 4096, create()).unwrap();
    let instance = manager.instance();
    let socket = manager.socket_path().to_path_buf();
    if let Some(count) = backing_objects(instance) {
        assert_eq!(count, 4);
    }

    manager.shutdown();
    if let Some(count) = backing_objects(instance) {
        assert_eq!(count, 0);
    }
    assert!(!socket.exists());
}

#[test]
fn repeated_attach_detach_leaks_nothing() {
    let manager = spawn_manager("leak");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("repeated_attach_detach_leaks_nothing", ctx);

    let id = ctx.get(Key::new(7), 8192, create()).unwrap();
    let fds_before = std::fs::read_dir("/proc/self/fd").map(Iterator::count).ok();

    for round in 0..50u64 {
        let addr = ctx.attach(id, None, AttachFlags::empty()).unwrap();
        unsafe { write_u64(addr, round) };
        ctx.detach(addr.as_ptr()).unwrap();
    }

    assert_eq!(ctx.attached_count(), 0);
    let stat = ctx.stat(id).unwrap();
    assert_eq!(stat.nattch, 0);
    assert!(stat.dtime >= stat.atime);
    assert!(stat.lpid > 0);

    let fds_after = std::fs::read_dir("/proc/self/fd").map(Iterator::count).ok();
    if let (Some(before), Some(after)) = (fds_before, fds_after) {
        // Other tests in this binary open descriptors concurrently.
        assert!(after <= before + 16, "descriptors grew from {before} to {after}");
    }

    let addr = ctx.attach(id, None, AttachFlags::RDONLY).unwrap();
    assert_eq!(unsafe { read_u64(addr) }, 49);
    ctx.detach(addr.as_ptr()).unwrap();
    assert_eq!(ctx.detach(addr.as_ptr()), Err(ShmError::InvalidArgument));
}

#[test]
fn dropping_a_context_detaches_its_segments() {
    let manager = spawn_manager("drop-ctx");
    let observer = ShmContext::connect_to(manager.socket_path());
    require_shm!("dropping_a_context_detaches_its_segments", observer);

    let first = observer.get(Key::new(5), 4096, create()).unwrap();
    let second = observer.get(Key::new(6), 4096, create()).unwrap();

    let ctx = ShmContext::connect_to(manager.socket_path());
    ctx.attach(first, None, AttachFlags::empty()).unwrap();
    ctx.attach(first, None, AttachFlags::RDONLY).unwrap();
    ctx.attach(second, None, AttachFlags::empty()).unwrap();
    assert_eq!(observer.stat(first).unwrap().nattch, 2);
    assert_eq!(observer.stat(second).unwrap().nattch, 1);

    drop(ctx);
    assert_eq!(observer.stat(first).unwrap().nattch, 0);
    assert_eq!(observer.stat(second).unwrap().nattch, 0);
}

#[test]
fn get_errors_travel_over_the_wire() {
    let manager = spawn_manager("errors");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("get_errors_travel_over_the_wire", ctx);

    assert_eq!(
        ctx.get(Key::new(5), 4096, GetFlags::empty()),
        Err(ShmError::NotFound)
    );
    let id = ctx.get(Key::new(5), 4096, create()).unwrap();
    assert_eq!(
        ctx.get(Key::new(5), 4096, create() | GetFlags::EXCL),
        Err(ShmError::Exists)
    );
    assert_eq!(
        ctx.get(Key::new(5), 8192, GetFlags::empty()),
        Err(ShmError::InvalidArgument)
    );
    assert_eq!(ctx.get(Key::new(5), 100, GetFlags::empty()), Ok(id));
    assert_eq!(
        ctx.get(Key::new(6), 0, create()),
        Err(ShmError::InvalidArgument)
    );
    assert_eq!(
        ctx.control(id, ControlCommand::Stat, &mut SegmentStat::default()),
        Ok(())
    );
}

#[test]
fn permission_bits_are_enforced() {
    if is_root() {
        eprintln!("Skipping permission_bits_are_enforced: running as root");
        return;
    }
    let manager = spawn_manager("perm");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("permission_bits_are_enforced", ctx);

    let id = ctx
        .get(Key::new(9), 4096, GetFlags::CREATE.with_mode(0o400))
        .unwrap();
    let before = ctx.stat(id).unwrap();

    assert_eq!(
        ctx.attach(id, None, AttachFlags::empty()),
        Err(ShmError::PermissionDenied)
    );
    assert_eq!(
        ctx.get(Key::new(9), 4096, GetFlags::empty().with_mode(0o600)),
        Err(ShmError::PermissionDenied)
    );
    assert_eq!(ctx.stat(id).unwrap(), before);

    let addr = ctx.attach(id, None, AttachFlags::RDONLY).unwrap();
    assert_eq!(ctx.stat(id).unwrap().nattch, 1);
    ctx.detach(addr.as_ptr()).unwrap();

    // Owner may still manage a segment it cannot write.
    ctx.remove(id).unwrap();
}

#[test]
fn set_and_lock_update_the_descriptor() {
    let manager = spawn_manager("set");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("set_and_lock_update_the_descriptor", ctx);

    let uid = rustix::process::geteuid().as_raw();
    let gid = rustix::process::getegid().as_raw();
    let id = ctx.get(Key::new(11), 4096, create()).unwrap();
    let before = ctx.stat(id).unwrap();
    assert_eq!(before.perm.key, 11);
    assert_eq!(before.perm.cuid, uid);
    assert_eq!(before.perm.mode, 0o600);
    assert_eq!(before.size, 4096);
    assert_eq!(before.cpid, std::process::id() as i32);

    ctx.set(id, uid, gid, 0o640).unwrap();
    let mut stat = SegmentStat::default();
    ctx.control(id, ControlCommand::Lock, &mut stat).unwrap();
    // Only Stat fills the caller's buffer.
    assert_eq!(stat, SegmentStat::default());

    let after = ctx.stat(id).unwrap();
    assert_eq!(after.perm.mode, 0o640 | mode::LOCKED);
    assert_eq!((after.perm.uid, after.perm.gid), (uid, gid));
    assert!(after.ctime >= before.ctime);

    ctx.control(id, ControlCommand::Unlock, &mut stat).unwrap();
    assert_eq!(ctx.stat(id).unwrap().perm.mode, 0o640);
}

#[test]
fn fixed_and_rounded_addresses() {
    let manager = spawn_manager("fixed");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("fixed_and_rounded_addresses", ctx);

    let id = ctx.get(Key::new(13), 4096, create()).unwrap();

    // Find a free, page-aligned address by mapping once and letting go.
    let probe = ctx.attach(id, None, AttachFlags::empty()).unwrap();
    ctx.detach(probe.as_ptr()).unwrap();

    let at = ctx.attach(id, Some(probe), AttachFlags::empty()).unwrap();
    assert_eq!(at, probe);
    ctx.detach(at.as_ptr()).unwrap();

    let misaligned = NonNull::new(probe.as_ptr().wrapping_byte_add(1)).unwrap();
    assert_eq!(
        ctx.attach(id, Some(misaligned), AttachFlags::empty()),
        Err(ShmError::InvalidArgument)
    );
    let rounded = ctx.attach(id, Some(misaligned), AttachFlags::RND).unwrap();
    assert_eq!(rounded, probe);
    ctx.detach(rounded.as_ptr()).unwrap();

    assert_eq!(
        ctx.attach(id, None, AttachFlags::REMAP),
        Err(ShmError::InvalidArgument)
    );
    assert_eq!(ctx.stat(id).unwrap().nattch, 0);
}

#[test]
fn failed_mapping_is_undone_on_the_manager() {
    let manager = spawn_manager("undo");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("failed_mapping_is_undone_on_the_manager", ctx);

    let first = ctx.get(Key::new(21), 4096, create()).unwrap();
    let second = ctx.get(Key::new(22), 4096, create()).unwrap();
    let occupied = ctx.attach(first, None, AttachFlags::empty()).unwrap();

    assert_eq!(
        ctx.attach(second, Some(occupied), AttachFlags::empty()),
        Err(ShmError::InvalidArgument)
    );
    // Segments attached through the context are never replaced.
    assert_eq!(
        ctx.attach(second, Some(occupied), AttachFlags::REMAP),
        Err(ShmError::InvalidArgument)
    );
    assert_eq!(ctx.stat(second).unwrap().nattch, 0);
    assert_eq!(ctx.stat(first).unwrap().nattch, 1);
    assert_eq!(ctx.attached_count(), 1);
    ctx.detach(occupied.as_ptr()).unwrap();
}

#[test]
fn remap_replaces_foreign_mappings() {
    let manager = spawn_manager("remap");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("remap_replaces_foreign_mappings", ctx);

    let id = ctx.get(Key::new(23), 4096, create()).unwrap();
    let reserved = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            4096,
            rustix::mm::ProtFlags::empty(),
            rustix::mm::MapFlags::PRIVATE,
        )
    }
    .unwrap();
    let reserved = NonNull::new(reserved).unwrap();

    assert_eq!(
        ctx.attach(id, Some(reserved), AttachFlags::empty()),
        Err(ShmError::InvalidArgument)
    );
    let addr = ctx.attach(id, Some(reserved), AttachFlags::REMAP).unwrap();
    assert_eq!(addr, reserved);
    unsafe { write_u64(addr, 5) };
    assert_eq!(ctx.stat(id).unwrap().nattch, 1);
    // Detach unmaps the range, reservation included.
    ctx.detach(addr.as_ptr()).unwrap();
}

#[test]
fn concurrent_creators_agree_on_one_segment() {
    let manager = spawn_manager("race");
    let probe = ShmContext::connect_to(manager.socket_path());
    require_shm!("concurrent_creators_agree_on_one_segment", probe);

    let ids: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let ctx = ShmContext::connect_to(manager.socket_path());
                    let id = ctx.get(Key::new(77), 4096, create()).unwrap();
                    let addr = ctx.attach(id, None, AttachFlags::empty()).unwrap();
                    ctx.detach(addr.as_ptr()).unwrap();
                    id
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(probe.stat(ids[0]).unwrap().nattch, 0);
    assert_eq!(backing_objects(manager.instance()).unwrap_or(1), 1);
}

#[test]
fn shared_context_across_threads() {
    let manager = spawn_manager("threads");
    let ctx = ShmContext::connect_to(manager.socket_path());
    require_shm!("shared_context_across_threads", ctx);

    let id = ctx.get(Key::new(31), 4096, create()).unwrap();
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    let addr = ctx.attach(id, None, AttachFlags::empty()).unwrap();
                    ctx.stat(id).unwrap();
                    ctx.detach(addr.as_ptr()).unwrap();
                }
            });
        }
    });
    assert_eq!(ctx.attached_count(), 0);
    assert_eq!(ctx.stat(id).unwrap().nattch, 0);
}

#[test]
fn client_reconnects_after_manager_restart() {
    init_test_tracing();
    let socket = unique_socket("restart");
    let config = ManagerConfig {
        socket_path: socket.clone(),
        ..ManagerConfig::default()
    };

    let first = Manager::spawn(config.clone()).unwrap();
    let ctx = ShmContext::connect_to(&socket);
    require_shm!("client_reconnects_after_manager_restart", ctx);
    let id = ctx.get(Key::new(3), 4096, create()).unwrap();
    first.shutdown();

    assert_eq!(ctx.stat(id), Err(ShmError::NotSupported));

    let second = Manager::spawn(config).unwrap();
    // The new manager starts empty.
    assert_eq!(
        ctx.get(Key::new(3), 4096, GetFlags::empty()),
        Err(ShmError::NotFound)
    );
    let id = ctx.get(Key::new(3), 4096, create()).unwrap();
    let addr = ctx.attach(id, None, AttachFlags::empty()).unwrap();
    ctx.detach(addr.as_ptr()).unwrap();
    second.shutdown();
}

fn raw_header(class: u32, len: u32, service: u32, subtype: u32) -> Vec<u8> {
    [class, len, service, subtype]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

#[test]
fn foreign_service_is_not_handled() {
    let manager = spawn_manager("foreign");
    let mut stream = UnixStream::connect(manager.socket_path()).unwrap();

    let mut message = raw_header(class::REQUEST, 24, 0x1234_5678, Subtype::Detach as u32);
    message.extend_from_slice(&[0u8; 8]);
    stream.write_all(&message).unwrap();

    let mut reply = [0u8; HEADER_SIZE + 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(
        decode_reply(&reply, Subtype::Detach).unwrap(),
        Err(ShmError::NotHandled)
    );

    // The connection stays usable for the real service.
    let mut message = raw_header(class::REQUEST, 24, SERVICE_ID, Subtype::Detach as u32);
    message.extend_from_slice(&[0u8; 8]);
    stream.write_all(&message).unwrap();
    stream.read_exact(&mut reply).unwrap();
    // Nothing was ever created, so slot 0 does not exist.
    assert_eq!(
        decode_reply(&reply, Subtype::Detach).unwrap(),
        Err(ShmError::InvalidArgument)
    );
}

#[test]
fn malformed_length_drops_the_connection() {
    let manager = spawn_manager("malformed");
    let mut stream = UnixStream::connect(manager.socket_path()).unwrap();

    stream
        .write_all(&raw_header(class::REQUEST, 4, SERVICE_ID, Subtype::Get as u32))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);

    // Other clients are unaffected.
    let ctx = ShmContext::connect_to(manager.socket_path());
    assert_eq!(
        ctx.get(Key::new(1), 16, GetFlags::empty()),
        Err(ShmError::NotFound)
    );
}
