//! One event loop per OS thread, plus a round-robin pool of them
//! (spec.md §3/§4.7 "EventLoopThread(Pool)"). Grounded on muduo's
//! `EventLoopThread.{h,cc}` and `EventLoopThreadPool.h`.

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

type InitCallback = Box<dyn FnOnce(&Arc<EventLoop>) + Send + 'static>;

struct Shared {
    loop_: Mutex<Option<Arc<EventLoop>>>,
    cond: Condvar,
}

/// Spawns one OS thread, publishes the `EventLoop` it creates there once
/// looping is about to start, and joins it (after requesting `quit`) on
/// drop.
pub struct EventLoopThread {
    shared: Arc<Shared>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> EventLoopThread {
        EventLoopThread {
            shared: Arc::new(Shared {
                loop_: Mutex::new(None),
                cond: Condvar::new(),
            }),
            join_handle: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Starts the OS thread and blocks until its `EventLoop` exists,
    /// returning a handle to it (matches muduo's `startLoop()`).
    pub fn start_loop(&self) -> Arc<EventLoop> {
        self.start_loop_with_init(None)
    }

    pub fn start_loop_with_init(&self, init: Option<InitCallback>) -> Arc<EventLoop> {
        assert!(
            self.join_handle.lock().unwrap().is_none(),
            "EventLoopThread::start_loop called twice"
        );
        let shared = self.shared.clone();
        let builder = thread::Builder::new().name(self.name.clone());
        let handle = builder
            .spawn(move || {
                let loop_ = EventLoop::new();
                if let Some(cb) = init {
                    cb(&loop_);
                }
                {
                    let mut guard = shared.loop_.lock().unwrap();
                    *guard = Some(loop_.clone());
                    shared.cond.notify_one();
                }
                loop_.run();
            })
            .expect("failed to spawn event loop thread");
        *self.join_handle.lock().unwrap() = Some(handle);

        let mut guard = self.shared.loop_.lock().unwrap();
        while guard.is_none() {
            guard = self.shared.cond.wait(guard).unwrap();
        }
        guard.clone().expect("loop published")
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        // Not 100% race-free (the thread's loop could still be mid-`run()`
        // setup), same caveat muduo documents on this destructor.
        if let Some(loop_) = self.shared.loop_.lock().unwrap().clone() {
            loop_.quit();
        }
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Shared init hook run on every sub-loop's thread before it starts looping.
pub type LoopInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Distributes accepted connections round-robin across a fixed-size pool of
/// `EventLoopThread`s. With zero threads, every caller is handed `base_loop`
/// (single-threaded mode).
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
    next: Cell<usize>,
    started: Cell<bool>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads: 0,
            threads: Vec::new(),
            loops: Vec::new(),
            next: Cell::new(0),
            started: Cell::new(false),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, cb: Option<LoopInitCallback>) {
        assert!(!self.started.get());
        self.started.set(true);

        for i in 0..self.num_threads {
            let thread_name = format!("{}{}", self.name, i);
            let thread = EventLoopThread::new(thread_name);
            let init: Option<InitCallback> = cb.clone().map(|cb| {
                let boxed: InitCallback = Box::new(move |l: &Arc<EventLoop>| cb(l));
                boxed
            });
            let loop_ = thread.start_loop_with_init(init);
            self.loops.push(loop_);
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(cb) = &cb {
                cb(&self.base_loop);
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Round-robin next loop; `base_loop` when the pool has no sub-threads.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let idx = self.next.get();
        let loop_ = self.loops[idx].clone();
        self.next.set((idx + 1) % self.loops.len());
        loop_
    }

    /// Deterministic loop selection by hash, used so all connections from
    /// the same peer land on the same sub-loop if a caller wants that.
    pub fn get_loop_for_hash(&self, hash_code: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        self.loops[hash_code % self.loops.len()].clone()
    }

    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
