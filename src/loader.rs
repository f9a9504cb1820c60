//! Background sound loading.
//!
//! Validation and backend opening run on one worker thread; completion is
//! communicated through a single-writer/single-reader slot the main thread
//! polls each frame. A load only ever ends as loaded or ignored, there is no
//! mid-flight cancel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::backend::{Mixer, OpenedSource, SoundDesc};
use crate::config::AudioConfig;
use crate::sniff::{self, SniffVerdict};

/// Result of one load, parked until the owning sound polls it.
pub enum LoadState<S> {
    Pending,
    Loaded(OpenedSource<S>),
    /// Permanently failed; the sound becomes a silent no-op.
    Ignored,
}

pub struct LoadSlot<S> {
    state: Mutex<LoadState<S>>,
    done: AtomicBool,
}

impl<S> LoadSlot<S> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoadState::Pending),
            done: AtomicBool::new(false),
        })
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Worker side: publish the outcome. Called exactly once.
    fn complete(&self, state: LoadState<S>) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
        self.done.store(true, Ordering::Release);
    }

    /// Main-thread side: take the outcome once `is_done` reports true.
    pub fn take(&self) -> LoadState<S> {
        if !self.is_done() {
            return LoadState::Pending;
        }
        match self.state.lock() {
            Ok(mut s) => std::mem::replace(&mut *s, LoadState::Ignored),
            Err(_) => LoadState::Ignored,
        }
    }
}

struct Job<M: Mixer> {
    path: PathBuf,
    desc: SoundDesc,
    config: AudioConfig,
    slot: Arc<LoadSlot<M::Source>>,
}

/// Owns the worker thread; dropped with the engine.
pub struct Loader<M: Mixer> {
    tx: Option<Sender<Job<M>>>,
    worker: Option<JoinHandle<()>>,
}

impl<M: Mixer + 'static> Loader<M> {
    pub fn new() -> Self {
        let (tx, rx) = channel::<Job<M>>();
        let worker = std::thread::Builder::new()
            .name("kumi-audio-loader".to_string())
            .spawn(move || worker_loop::<M>(rx))
            .ok();
        if worker.is_none() {
            warn!("could not spawn loader thread, loads will run inline");
        }
        Self {
            tx: worker.as_ref().map(|_| tx),
            worker,
        }
    }

    /// Queue one load. The returned slot is polled by the owning sound.
    pub fn enqueue(
        &self,
        path: PathBuf,
        desc: SoundDesc,
        config: AudioConfig,
    ) -> Arc<LoadSlot<M::Source>> {
        let slot = LoadSlot::new();
        let mut job = Job {
            path,
            desc,
            config,
            slot: Arc::clone(&slot),
        };
        if let Some(tx) = &self.tx {
            match tx.send(job) {
                Ok(()) => return slot,
                Err(returned) => job = returned.0,
            }
        }
        // worker unavailable: degrade to a synchronous load
        run_job::<M>(job);
        slot
    }
}

impl<M: Mixer> Drop for Loader<M> {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop<M: Mixer>(rx: Receiver<Job<M>>) {
    while let Ok(job) = rx.recv() {
        run_job::<M>(job);
    }
    debug!("loader thread exiting");
}

fn run_job<M: Mixer>(job: Job<M>) {
    match sniff::sniff_file(&job.path, &job.config) {
        Ok(SniffVerdict::Accept(format)) => {
            debug!(path = %job.path.display(), ?format, "sniff accepted");
        }
        Ok(SniffVerdict::Reject(reason)) => {
            info!(path = %job.path.display(), ?reason, "ignoring audio file");
            job.slot.complete(LoadState::Ignored);
            return;
        }
        Err(e) => {
            warn!(path = %job.path.display(), "cannot read audio file: {e:#}");
            job.slot.complete(LoadState::Ignored);
            return;
        }
    }

    match M::open_source(&job.path, &job.desc, &job.config) {
        Ok(opened) => job.slot.complete(LoadState::Loaded(opened)),
        Err(e) => {
            warn!(path = %job.path.display(), "backend failed to open: {e:#}");
            job.slot.complete(LoadState::Ignored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockMixer;
    use std::fs::File;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn desc(path: &std::path::Path) -> SoundDesc {
        SoundDesc {
            path: path.to_path_buf(),
            stream: false,
            overlayable: false,
            looped: false,
        }
    }

    fn wait_done<S>(slot: &LoadSlot<S>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !slot.is_done() {
            assert!(Instant::now() < deadline, "load never completed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn write_wav_header(path: &std::path::Path) {
        let mut data = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
        data.resize(256, 0);
        File::create(path).unwrap().write_all(&data).unwrap();
    }

    #[test]
    fn valid_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        write_wav_header(&path);

        let loader = Loader::<MockMixer>::new();
        let slot = loader.enqueue(path.clone(), desc(&path), AudioConfig::default());
        wait_done(&slot);
        match slot.take() {
            LoadState::Loaded(opened) => {
                assert_eq!(opened.source.path, path);
            }
            _ => panic!("expected a loaded source"),
        }
    }

    #[test]
    fn undersized_file_is_ignored_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        File::create(&path).unwrap().write_all(b"0123456789").unwrap();

        let loader = Loader::<MockMixer>::new();
        let slot = loader.enqueue(path.clone(), desc(&path), AudioConfig::default());
        wait_done(&slot);
        assert!(matches!(slot.take(), LoadState::Ignored));
    }

    #[test]
    fn unknown_extension_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        File::create(&path).unwrap().write_all(b"hello").unwrap();

        let loader = Loader::<MockMixer>::new();
        let slot = loader.enqueue(path.clone(), desc(&path), AudioConfig::default());
        wait_done(&slot);
        assert!(matches!(slot.take(), LoadState::Ignored));
    }

    #[test]
    fn backend_open_failure_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unopenable.wav");
        write_wav_header(&path);

        let loader = Loader::<MockMixer>::new();
        let slot = loader.enqueue(path.clone(), desc(&path), AudioConfig::default());
        wait_done(&slot);
        assert!(matches!(slot.take(), LoadState::Ignored));
    }

    #[test]
    fn take_before_done_is_pending() {
        let slot = LoadSlot::<u32>::new();
        assert!(matches!(slot.take(), LoadState::Pending));
    }
}
