//! Asynchronous DNS resolution over a worker thread.
//!
//! `getaddrinfo` blocks, so jobs are handed to a lazily started worker
//! thread and the calling task polls the shared result slot through short
//! sleeps. The worker never touches loop state; the mutex around the slot
//! is the only lock in the crate.

use std::collections::VecDeque;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::net::Endpoint;
use crate::ops::async_sleep;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ResolveState {
    canceled: AtomicBool,
    slot: Mutex<Option<Result<Vec<Endpoint>>>>,
}

struct Job {
    host: String,
    service: String,
    state: Arc<ResolveState>,
}

#[derive(Default)]
struct WorkerQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
}

fn worker_queue() -> &'static WorkerQueue {
    static QUEUE: OnceLock<WorkerQueue> = OnceLock::new();
    static WORKER: OnceLock<()> = OnceLock::new();

    let queue = QUEUE.get_or_init(WorkerQueue::default);
    WORKER.get_or_init(|| {
        thread::Builder::new()
            .name("riptide-resolver".into())
            .spawn(move || worker_main(queue))
            .expect("failed to start resolver worker thread");
    });
    queue
}

fn worker_main(queue: &'static WorkerQueue) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock().unwrap();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                jobs = queue.available.wait(jobs).unwrap();
            }
        };

        if job.state.canceled.load(Ordering::Acquire) {
            let mut slot = job.state.slot.lock().unwrap();
            *slot = Some(Err(Error::from_raw(libc::ECANCELED)));
            continue;
        }

        let resolved = resolve_ipv4_tcp(&job.host, &job.service);
        let mut slot = job.state.slot.lock().unwrap();
        *slot = Some(resolved);
    }
}

fn map_gai_error(code: i32) -> Error {
    let mapped = match code {
        libc::EAI_AGAIN => libc::EAGAIN,
        libc::EAI_NONAME => libc::ENOENT,
        libc::EAI_MEMORY => libc::ENOMEM,
        _ => libc::EHOSTUNREACH,
    };
    Error::from_raw(mapped)
}

fn resolve_ipv4_tcp(host: &str, service: &str) -> Result<Vec<Endpoint>> {
    let host = CString::new(host).map_err(|_| Error::from_raw(libc::EINVAL))?;
    let service = CString::new(service).map_err(|_| Error::from_raw(libc::EINVAL))?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;

    let mut raw_result: *mut libc::addrinfo = std::ptr::null_mut();
    let status =
        unsafe { libc::getaddrinfo(host.as_ptr(), service.as_ptr(), &hints, &mut raw_result) };
    if status != 0 {
        return Err(map_gai_error(status));
    }

    let mut endpoints = Vec::new();
    let mut cursor = raw_result;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if entry.ai_family == libc::AF_INET && !entry.ai_addr.is_null() {
            let addr = unsafe { &*(entry.ai_addr as *const libc::sockaddr_in) };
            endpoints.push(Endpoint::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            ));
        }
        cursor = entry.ai_next;
    }
    unsafe { libc::freeaddrinfo(raw_result) };

    if endpoints.is_empty() {
        return Err(Error::from_raw(libc::ENOENT));
    }
    Ok(endpoints)
}

/// Resolves `host`/`service` to IPv4 TCP endpoints without blocking the
/// loop. Cancellation yields `ECANCELED` and marks the job so the worker
/// skips it if still queued.
pub async fn async_resolve(
    host: &str,
    service: &str,
    token: CancelToken,
) -> Result<Vec<Endpoint>> {
    if token.stop_requested() {
        return Err(Error::from_raw(libc::ECANCELED));
    }

    let state = Arc::new(ResolveState {
        canceled: AtomicBool::new(false),
        slot: Mutex::new(None),
    });

    let queue = worker_queue();
    queue.jobs.lock().unwrap().push_back(Job {
        host: host.to_owned(),
        service: service.to_owned(),
        state: state.clone(),
    });
    queue.available.notify_one();

    loop {
        if token.stop_requested() {
            state.canceled.store(true, Ordering::Release);
            return Err(Error::from_raw(libc::ECANCELED));
        }

        if let Some(result) = state.slot.lock().unwrap().take() {
            return result;
        }

        async_sleep(POLL_INTERVAL, token.clone()).await?;
    }
}
