//! One run: pre-run, coordinator sizing, dispatch waves, post-run.

use std::mem;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::state::{RunOutcome, RunReport, RunState};
use super::Executor;
use crate::callbacks::{CallbackSet, Control};
use crate::device::Device;
use crate::error::{ExecError, Result, Stage};
use crate::partition::{chunk_size, peer_capacity, RangeCursor, TaskRange};
use crate::wave::WaveSynchronizer;

/// Counters gathered while dispatching.
#[derive(Debug, Default)]
struct DispatchStats {
    waves: u64,
    tasks_dispatched: u64,
}

impl Executor {
    /// Execute one full run.
    ///
    /// `timeout` bounds each wave's wait; `None` falls back to
    /// [`ExecutorConfig::wave_timeout_ms`](crate::config::ExecutorConfig),
    /// and if that is unset too the wait is unbounded.
    ///
    /// A bounded wait uses the tokio timer, so with a timeout in effect
    /// `run` must be polled on a runtime with the time driver enabled
    /// (`Builder::enable_time`, or `enable_all`); tokio panics otherwise.
    /// Unbounded runs need no timer.
    ///
    /// A wave that times out leaves its device work running; the device
    /// runtime is finalized before `run` returns and brought up again by
    /// the next run.
    ///
    /// Post-run always executes once the run got going, and its error is
    /// chained to any earlier one. A hook returning [`Control::Abort`] ends
    /// the run with `Ok(RunOutcome::Aborted)`.
    pub async fn run(&mut self, timeout: Option<Duration>) -> Result<RunOutcome> {
        self.ensure_live(Stage::PreRun)?;
        let mut callbacks = self.callbacks.take().ok_or_else(|| {
            error!("Callbacks not set for executor");
            ExecError::missing(Stage::PreRun, "callbacks", "setup() has not been called")
        })?;

        let timeout = timeout.or_else(|| self.config.wave_timeout());
        let started = Instant::now();
        let mut stats = DispatchStats::default();

        self.run_state = RunState::NotStarted;
        self.task_total = 0;
        self.range_multiplier = 1;

        let main = self
            .run_stages(&mut callbacks, timeout, &mut stats)
            .await;
        let post = self.post_run(&mut callbacks);
        self.callbacks = Some(callbacks);

        let mut result = match (main, post) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), post) => Err(e.chain(post)),
        };

        let timed_out = matches!(
            result.as_ref().map_err(ExecError::primary),
            Err(ExecError::Timeout { .. })
        );
        if timed_out {
            warn!(
                "Peer {} finalizing device runtime after wave timeout",
                self.peer_id
            );
            let teardown = self.teardown_runtime().await;
            result = result.map_err(|e| e.chain(teardown));
        }

        let report = RunReport {
            waves: stats.waves,
            tasks_dispatched: stats.tasks_dispatched,
            task_total: self.task_total,
            outcome: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(ToString::to_string),
            final_state: self.run_state,
            elapsed: started.elapsed(),
        };
        match &result {
            Ok(outcome) => info!(
                "Peer {} run {} after {} wave(s) in {:?}",
                self.peer_id, outcome, report.waves, report.elapsed
            ),
            Err(e) => error!("Peer {} run failed: {}", self.peer_id, e),
        }
        self.last_report = Some(report);
        result
    }

    async fn run_stages(
        &mut self,
        cbs: &mut CallbackSet,
        timeout: Option<Duration>,
        stats: &mut DispatchStats,
    ) -> Result<RunOutcome> {
        self.pre_run(cbs).await?;

        if !self.is_coordinator() {
            debug!("Peer {} has no dispatch role; standing by", self.peer_id);
            return Ok(RunOutcome::Standby);
        }

        let chunk = self.coordinator_sizing(cbs)?;
        self.dispatch_loop(cbs, chunk, timeout, stats).await
    }

    /// Runtime bring-up, `on_start`, source retrieval and compilation.
    async fn pre_run(&mut self, cbs: &mut CallbackSet) -> Result<()> {
        if self.runtime.is_none() {
            let request = self.negotiated.unwrap_or_else(|| cbs.device_request());
            self.bring_up(request, Stage::PreRun).await?;
        }
        if !self.runtime.as_ref().is_some_and(|rt| rt.is_usable()) {
            return Err(ExecError::bad_state(
                Stage::PreRun,
                "device runtime is not usable",
            ));
        }
        self.run_state.advance(RunState::RuntimeReady);

        let ctx = self.context();
        if let Some(on_start) = cbs.on_start.as_mut() {
            if let Err(e) = on_start(&ctx) {
                error!("on_start failed: {}", e);
                return Err(e);
            }
        }
        self.run_state.advance(RunState::Started);

        self.source = None;
        let source = (cbs.get_code)(&ctx)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| {
                error!("get_code returned no source");
                ExecError::missing(Stage::PreRun, "get_code", "returned no source")
            })?;
        debug!("Retrieved {} bytes of program source", source.len());
        self.source = Some(source);
        self.run_state.advance(RunState::GotCode);

        self.build_options = None;
        if let Some(get_build_options) = cbs.get_build_options.as_mut() {
            self.build_options = get_build_options(&ctx);
            if self.build_options.is_none() {
                warn!("get_build_options returned nothing; building without options");
            }
        }
        self.run_state.advance(RunState::GotBuildOptions);

        let compiled = match (self.runtime.as_mut(), self.source.as_deref()) {
            (Some(runtime), Some(source)) => {
                runtime
                    .load_program(source, self.build_options.as_deref())
                    .await
            }
            _ => Err(ExecError::bad_state(
                Stage::PreRun,
                "runtime or source vanished before compilation",
            )),
        };
        if let Some(on_code_compile) = cbs.on_code_compile.as_mut() {
            on_code_compile(&ctx, compiled.is_ok());
        }
        if let Err(e) = compiled {
            error!("Compilation failed: {}", e);
            return Err(e);
        }
        self.run_state.advance(RunState::CompiledCode);
        Ok(())
    }

    /// Peer 0 only: task count, multiplier, capacity and global data.
    ///
    /// Returns the per-device chunk size.
    fn coordinator_sizing(&mut self, cbs: &mut CallbackSet) -> Result<u64> {
        let ctx = self.context();
        let total = (cbs.get_num_tasks)(&ctx);
        if total == 0 {
            error!("get_num_tasks returned 0");
            return Err(ExecError::invalid_value(
                Stage::Sizing,
                "task count cannot be 0",
            ));
        }
        self.task_total = total;
        self.run_state.advance(RunState::GotTaskCount);

        let ctx = self.context();
        let multiplier = cbs
            .get_task_range_multiplier
            .as_mut()
            .map_or(self.config.default_range_multiplier, |hook| hook(&ctx))
            .max(1);
        self.range_multiplier = multiplier;
        self.run_state.advance(RunState::GotRangeMultiplier);

        let capacity = peer_capacity(
            self.runtime
                .iter()
                .flat_map(|rt| rt.devices())
                .map(Device::info),
        );
        let peers = self.peer_count as usize;
        let mut table = Vec::new();
        table
            .try_reserve_exact(peers)
            .map_err(|_| ExecError::OutOfMemory {
                stage: Stage::Sizing,
                requested: peers.saturating_mul(mem::size_of::<u64>()),
            })?;
        table.resize(peers, 0);
        table[self.peer_id as usize] = capacity;
        self.capacity_per_peer = table;
        self.run_state.advance(RunState::GotCapacity);

        let chunk = chunk_size(capacity, multiplier)?;
        debug!(
            "Sized run: {} task(s), capacity {}, multiplier {}, chunk {}",
            total, capacity, multiplier, chunk
        );

        if let Some(get_global_data) = cbs.get_global_data.as_mut() {
            let data = get_global_data(&ctx).map_err(|e| {
                error!("get_global_data failed: {}", e);
                e
            })?;
            debug!("Retrieved {} bytes of global data", data.len());
            self.global_data = Some(data);
        }
        self.run_state.advance(RunState::GotGlobalData);
        Ok(chunk)
    }

    /// Device brackets around the wave loop.
    async fn dispatch_loop(
        &mut self,
        cbs: &mut CallbackSet,
        chunk: u64,
        timeout: Option<Duration>,
        stats: &mut DispatchStats,
    ) -> Result<RunOutcome> {
        let devices: Vec<Device> = self
            .runtime
            .as_ref()
            .map(|rt| rt.devices().to_vec())
            .unwrap_or_default();
        let ctx = self.context();

        let mut started = 0;
        let mut result = Ok(RunOutcome::Completed);
        match cbs.on_device_start.as_mut() {
            Some(on_device_start) => {
                for device in &devices {
                    if let Err(e) = on_device_start(&ctx, device, self.global_data.as_ref()) {
                        error!("on_device_start failed on device {}: {}", device.index(), e);
                        result = Err(e);
                        break;
                    }
                    started += 1;
                }
            }
            None => started = devices.len(),
        }

        if result.is_ok() {
            self.run_state.advance(RunState::DevicesStarted);
            result = self
                .run_waves(cbs, &devices, chunk, timeout, stats)
                .await;
            self.run_state.advance(RunState::DevicesDoneRunning);
        }

        let mut finished = Ok(());
        if let Some(on_device_finish) = cbs.on_device_finish.as_mut() {
            for device in &devices[..started] {
                if let Err(e) = on_device_finish(&ctx, device, self.global_data.as_ref()) {
                    error!("on_device_finish failed on device {}: {}", device.index(), e);
                    finished = ExecError::combine(finished, Err(e));
                }
            }
        }
        if started == devices.len() {
            self.run_state.advance(RunState::DevicesFinished);
        }

        match (result, finished) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), finished) => Err(e.chain(finished)),
        }
    }

    /// Dispatch waves until the task range is consumed or a hook aborts.
    async fn run_waves(
        &mut self,
        cbs: &mut CallbackSet,
        devices: &[Device],
        chunk: u64,
        timeout: Option<Duration>,
        stats: &mut DispatchStats,
    ) -> Result<RunOutcome> {
        let ctx = self.context();
        let mut cursor = RangeCursor::new(self.task_total);

        let mut slots: Vec<(usize, TaskRange)> = Vec::new();
        slots
            .try_reserve_exact(devices.len())
            .map_err(|_| ExecError::OutOfMemory {
                stage: Stage::Dispatch,
                requested: devices
                    .len()
                    .saturating_mul(mem::size_of::<(usize, TaskRange)>()),
            })?;

        let mut wave = 0u64;
        while !cursor.is_exhausted() {
            slots.clear();
            let mut sync = WaveSynchronizer::new(wave);
            let mut failure: Option<ExecError> = None;

            for (pos, device) in devices.iter().enumerate() {
                let Some(range) = cursor.next_range(chunk) else {
                    break;
                };
                let event = match (cbs.on_device_range_exec)(
                    &ctx,
                    device,
                    self.global_data.as_ref(),
                    range,
                ) {
                    Ok(event) => event,
                    Err(e) => {
                        error!(
                            "on_device_range_exec failed on device {} for {}: {}",
                            device.index(),
                            range,
                            e
                        );
                        failure = Some(e);
                        break;
                    }
                };

                if let Err(e) = sync.observe(device.index(), &event) {
                    failure = Some(e);
                    break;
                }
                slots.push((pos, range));
                stats.tasks_dispatched += range.len();

                let queued = device
                    .queue()
                    .enqueue_wait(&event)
                    .and_then(|()| device.queue().flush());
                if let Err(e) = queued {
                    error!("Unable to flush the queue of device {}: {}", device.index(), e);
                    failure = Some(e);
                    break;
                }
            }
            debug!("Wave {} dispatched to {} device(s)", wave, slots.len());

            let report = match sync.wait(timeout).await {
                Ok(report) => report,
                Err(e) => {
                    error!("Wave {} did not complete: {}", wave, e);
                    return Err(match failure {
                        Some(first) => first.chain(Err(e)),
                        None => e,
                    });
                }
            };
            stats.waves += 1;

            let mut control = Control::Continue;
            if let Some(on_device_range_done) = cbs.on_device_range_done.as_mut() {
                for &(pos, range) in &slots {
                    let device = &devices[pos];
                    match on_device_range_done(&ctx, device, self.global_data.as_ref(), range) {
                        Ok(Control::Continue) => {}
                        Ok(Control::Abort) => {
                            info!(
                                "Device {} asked to stop after {} in wave {}",
                                device.index(),
                                range,
                                wave
                            );
                            control = Control::Abort;
                            break;
                        }
                        Err(e) => {
                            error!(
                                "on_device_range_done failed on device {} for {}: {}",
                                device.index(),
                                range,
                                e
                            );
                            failure.get_or_insert(ExecError::bad_state(
                                Stage::Dispatch,
                                format!(
                                    "range completion failed on device {} for {}: {}",
                                    device.index(),
                                    range,
                                    e
                                ),
                            ));
                            break;
                        }
                    }
                }
            }

            if let Some(e) = failure {
                return Err(e);
            }
            if let Some((index, reason)) = report.failures.first() {
                return Err(ExecError::runtime_op(
                    Stage::Dispatch,
                    format!("device {} failed in wave {}: {}", index, wave, reason),
                ));
            }

            if let Some(progress) = cbs.progress.as_mut() {
                progress(cursor.progress_percent());
            }
            if control == Control::Abort {
                return Ok(RunOutcome::Aborted);
            }
            wave += 1;
        }
        Ok(RunOutcome::Completed)
    }

    /// Release global data and call `on_finish` if the run got started.
    fn post_run(&mut self, cbs: &mut CallbackSet) -> Result<()> {
        let ctx = self.context();
        if let Some(data) = self.global_data.take() {
            match cbs.free_global_data.as_mut() {
                Some(free_global_data) => free_global_data(&ctx, data),
                None => drop(data),
            }
        }

        let started = self.run_state > RunState::NotStarted;
        self.run_state.advance(RunState::FreedGlobalData);

        let mut result = Ok(());
        if started {
            if let Some(on_finish) = cbs.on_finish.as_mut() {
                result = on_finish(&ctx).map_err(|e| {
                    error!("on_finish failed: {}", e);
                    e
                });
            }
        }
        self.run_state.advance(RunState::Finished);
        result
    }
}
