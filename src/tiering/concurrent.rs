//! Background compilation thread
//!
//! The main thread prepares a [`CompilationInput`] (which holds no heap
//! references) and sends it over a channel; the compiler thread builds
//! the optimized graph and sends it back. Results are only installed by
//! the main thread, at a call boundary, after re-validating dependencies.

use crate::jit::{self, CompilationInput, CompileError, CompiledGraph};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A job handed to the compiler thread
pub struct CompileRequest {
    pub id: u64,
    pub input: Arc<CompilationInput>,
}

/// A finished job
pub struct CompileResult {
    pub id: u64,
    pub result: Result<CompiledGraph, CompileError>,
}

/// Owner of the compiler thread
pub struct BackgroundCompiler {
    requests: Option<Sender<CompileRequest>>,
    results: Receiver<CompileResult>,
    handle: Option<JoinHandle<()>>,
    outstanding: usize,
}

impl BackgroundCompiler {
    pub fn spawn() -> io::Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<CompileRequest>();
        let (result_tx, result_rx) = mpsc::channel::<CompileResult>();
        let handle = thread::Builder::new()
            .name("quickjit-compiler".into())
            .spawn(move || {
                for request in request_rx {
                    let result = jit::build(&request.input);
                    if result_tx.send(CompileResult { id: request.id, result }).is_err() {
                        break;
                    }
                }
                tracing::trace!("compiler thread exiting");
            })?;
        Ok(Self {
            requests: Some(request_tx),
            results: result_rx,
            handle: Some(handle),
            outstanding: 0,
        })
    }

    /// Queue a job; false if the compiler thread is gone
    pub fn submit(&mut self, request: CompileRequest) -> bool {
        match &self.requests {
            Some(sender) if sender.send(request).is_ok() => {
                self.outstanding += 1;
                true
            }
            _ => false,
        }
    }

    /// Finished jobs, without blocking
    pub fn poll(&mut self) -> Vec<CompileResult> {
        let results: Vec<CompileResult> = self.results.try_iter().collect();
        self.outstanding = self.outstanding.saturating_sub(results.len());
        results
    }

    /// Block until every queued job has finished
    pub fn wait_all(&mut self) -> Vec<CompileResult> {
        let mut results = Vec::with_capacity(self.outstanding);
        while self.outstanding > 0 {
            match self.results.recv() {
                Ok(result) => {
                    self.outstanding -= 1;
                    results.push(result);
                }
                Err(_) => {
                    // the thread died; nothing more will arrive
                    self.outstanding = 0;
                }
            }
        }
        results
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        // closing the channel ends the thread's receive loop
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("compiler thread panicked");
            }
        }
    }
}
