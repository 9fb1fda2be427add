//! Wallpaper playback controller.
//!
//! Single authority for what the pipeline should be doing right now, and for
//! making it so. RPC commands, settings-change notifications and pipeline bus
//! events are all collapsed into [`ControllerEvent`] and consumed by one
//! task, so no two state mutations ever race.

use anyhow::{Context, Result};
use common::ControlCommand;
use tokio::sync::mpsc;

use crate::pipeline::{MediaPipeline, PipelineEvent, PipelineFactory, location_from_uri};
use crate::settings::{SettingKey, SettingsStore};

/// Everything that can mutate controller state.
#[derive(Debug)]
pub enum ControllerEvent {
    /// A validated command from the control socket.
    Control(ControlCommand),

    /// A settings store key changed on disk.
    SettingsChanged(SettingKey),

    /// Bus event from the pipeline built under `generation`.
    Pipeline { generation: u64, event: PipelineEvent },

    /// Terminate the daemon.
    Shutdown,
}

/// Observable playback state, derived from pipeline presence and the last
/// commanded play/pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Playing,
    Paused,
}

/// Owns the wallpaper state and the only handle to the active pipeline.
pub struct Controller<F: PipelineFactory> {
    settings: SettingsStore,
    factory: F,

    /// Configured media location; empty means "no media configured".
    video_uri: String,
    loop_enabled: bool,
    /// Always kept clamped to [0.0, 1.0].
    volume: f64,
    /// Last commanded play/pause state.
    is_playing: bool,
    /// Mirrors the store's enabled key.
    enabled: bool,

    /// Present iff a pipeline has been built and not yet torn down.
    pipeline: Option<F::Pipeline>,
    /// Bumped on every build; bus events tagged with an older value are from
    /// a superseded pipeline and are discarded.
    generation: u64,
}

impl<F: PipelineFactory> Controller<F> {
    /// Create the controller from an initial settings read.
    pub fn new(settings: SettingsStore, factory: F) -> Self {
        let initial = settings.settings().clone();
        Self {
            settings,
            factory,
            video_uri: initial.uri,
            loop_enabled: initial.loop_enabled,
            volume: initial.volume.clamp(0.0, 1.0),
            is_playing: false,
            enabled: initial.enabled,
            pipeline: None,
            generation: 0,
        }
    }

    /// Consume events until shutdown. The active pipeline is released before
    /// returning.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ControllerEvent>) {
        // Honor the persisted enabled state right away.
        if self.enabled {
            if let Err(e) = self.start() {
                log::error!("Initial playback start failed: {:#}", e);
            }
        }

        while let Some(event) = events.recv().await {
            if matches!(event, ControllerEvent::Shutdown) {
                log::info!("Controller shutting down");
                break;
            }
            if let Err(e) = self.handle_event(event) {
                log::error!("Command failed: {:#}", e);
            }
        }

        self.stop();
    }

    /// Single transition function for all event sources.
    pub fn handle_event(&mut self, event: ControllerEvent) -> Result<()> {
        match event {
            ControllerEvent::Control(command) => self.handle_command(command),
            ControllerEvent::SettingsChanged(key) => self.on_settings_changed(key),
            ControllerEvent::Pipeline { generation, event } => {
                self.on_pipeline_event(generation, event);
                Ok(())
            }
            ControllerEvent::Shutdown => {
                self.stop();
                Ok(())
            }
        }
    }

    fn handle_command(&mut self, command: ControlCommand) -> Result<()> {
        log::debug!("Handling command: {:?}", command);
        match command {
            ControlCommand::Play => self.play(),
            ControlCommand::Pause => self.pause(),
            ControlCommand::Stop => {
                self.stop();
                Ok(())
            }
            ControlCommand::SetVideo { uri } => self.set_video(uri),
            ControlCommand::SetVolume { volume } => self.set_volume(volume),
            ControlCommand::SetLoop { enabled } => {
                self.set_loop(enabled);
                Ok(())
            }
        }
    }

    /// Build a pipeline from the current configuration and start playback.
    ///
    /// Disabled state, an empty URI or a not-yet-existing file are transient
    /// preconditions, not faults: the call is a no-op and the previous
    /// pipeline (if any) keeps running. A failed build is an error.
    pub fn start(&mut self) -> Result<()> {
        if !self.enabled {
            log::debug!("start: wallpaper disabled");
            return Ok(());
        }
        let Some(location) = location_from_uri(&self.video_uri) else {
            log::debug!("start: no video configured");
            return Ok(());
        };
        if !location.exists() {
            log::debug!("start: {} does not exist yet", location.display());
            return Ok(());
        }

        // Never two pipelines: the old one goes down before the new one
        // comes up.
        self.stop();

        self.generation += 1;
        let pipeline = self
            .factory
            .build(&location, self.volume, self.generation)
            .with_context(|| format!("Failed to build pipeline for {}", location.display()))?;
        self.pipeline = Some(pipeline);

        self.play()
    }

    /// Resume a built pipeline. No-op without one; never builds implicitly.
    pub fn play(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.play()?;
            self.is_playing = true;
            log::info!("Playback started");
        }
        Ok(())
    }

    /// Pause a built pipeline. No-op without one.
    pub fn pause(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.pause()?;
            self.is_playing = false;
            log::info!("Playback paused");
        }
        Ok(())
    }

    /// Halt playback and release the pipeline. Safe to call in any state.
    pub fn stop(&mut self) {
        self.is_playing = false;
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.stop() {
                log::warn!("Pipeline stop reported: {:#}", e);
            }
        }
    }

    /// Update the configured URI and rebuild if the wallpaper is enabled.
    pub fn set_video(&mut self, uri: String) -> Result<()> {
        log::info!(
            "Video set to: {}",
            if uri.is_empty() { "(none)" } else { uri.as_str() }
        );
        self.video_uri = uri;
        if self.enabled { self.start() } else { Ok(()) }
    }

    /// Store the clamped volume and apply it live if a pipeline exists.
    pub fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.set_volume(self.volume)?;
        }
        Ok(())
    }

    /// Takes effect on the next end-of-stream, not retroactively.
    pub fn set_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    /// Re-read the changed key from the store and apply its operation.
    ///
    /// Only the notified key's handler runs, so unrelated changes never
    /// trigger a redundant rebuild.
    pub fn on_settings_changed(&mut self, key: SettingKey) -> Result<()> {
        self.settings.reload()?;
        let settings = self.settings.settings().clone();
        log::debug!("Applying settings change: {}", key.name());

        match key {
            SettingKey::Enabled => {
                self.enabled = settings.enabled;
                if self.enabled {
                    self.start()
                } else {
                    self.stop();
                    Ok(())
                }
            }
            SettingKey::Uri => self.set_video(settings.uri),
            SettingKey::Loop => {
                self.set_loop(settings.loop_enabled);
                Ok(())
            }
            SettingKey::Volume => self.set_volume(settings.volume),
        }
    }

    /// Bus event transition: restart on EOS while looping, otherwise fall
    /// back to idle. Errors are reported, never auto-retried.
    pub fn on_pipeline_event(&mut self, generation: u64, event: PipelineEvent) {
        if generation != self.generation {
            log::debug!("Ignoring {:?} from superseded pipeline", event);
            return;
        }

        match event {
            PipelineEvent::EndOfStream => {
                if self.loop_enabled {
                    if let Some(pipeline) = self.pipeline.as_mut() {
                        log::debug!("End of stream, looping");
                        if let Err(e) = pipeline.seek_to_start() {
                            log::warn!("Loop restart failed: {:#}", e);
                        }
                    }
                } else {
                    log::info!("Video playback finished");
                    self.stop();
                }
            }
            PipelineEvent::Error { message } => {
                log::error!("Pipeline error: {}", message);
                self.stop();
            }
        }
    }

    #[allow(dead_code)] // Part of the state surface for tests and queries
    pub fn phase(&self) -> PlaybackPhase {
        match (&self.pipeline, self.is_playing) {
            (None, _) => PlaybackPhase::Idle,
            (Some(_), true) => PlaybackPhase::Playing,
            (Some(_), false) => PlaybackPhase::Paused,
        }
    }

    #[allow(dead_code)] // Part of the state surface for tests and queries
    pub fn volume(&self) -> f64 {
        self.volume
    }

    #[allow(dead_code)] // Part of the state surface for tests and queries
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum FakeCommand {
        Build { location: PathBuf, volume: f64 },
        Play,
        Pause,
        Stop,
        SetVolume(f64),
        SeekToStart,
    }

    #[derive(Default)]
    struct Shared {
        commands: Vec<FakeCommand>,
        live: u32,
        max_live: u32,
    }

    impl Shared {
        fn count(&self, wanted: &FakeCommand) -> usize {
            self.commands.iter().filter(|c| *c == wanted).count()
        }
    }

    struct FakePipeline {
        shared: Rc<RefCell<Shared>>,
    }

    impl MediaPipeline for FakePipeline {
        fn play(&mut self) -> Result<()> {
            self.shared.borrow_mut().commands.push(FakeCommand::Play);
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            self.shared.borrow_mut().commands.push(FakeCommand::Pause);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.shared.borrow_mut().commands.push(FakeCommand::Stop);
            Ok(())
        }

        fn set_volume(&mut self, volume: f64) -> Result<()> {
            self.shared
                .borrow_mut()
                .commands
                .push(FakeCommand::SetVolume(volume));
            Ok(())
        }

        fn seek_to_start(&mut self) -> Result<()> {
            self.shared
                .borrow_mut()
                .commands
                .push(FakeCommand::SeekToStart);
            Ok(())
        }
    }

    impl Drop for FakePipeline {
        fn drop(&mut self) {
            self.shared.borrow_mut().live -= 1;
        }
    }

    struct FakeFactory {
        shared: Rc<RefCell<Shared>>,
        fail_builds: bool,
    }

    impl PipelineFactory for FakeFactory {
        type Pipeline = FakePipeline;

        fn build(&mut self, location: &Path, volume: f64, _generation: u64) -> Result<FakePipeline> {
            if self.fail_builds {
                anyhow::bail!("required element unavailable");
            }
            let mut shared = self.shared.borrow_mut();
            shared.commands.push(FakeCommand::Build {
                location: location.to_path_buf(),
                volume,
            });
            shared.live += 1;
            shared.max_live = shared.max_live.max(shared.live);
            drop(shared);
            Ok(FakePipeline {
                shared: self.shared.clone(),
            })
        }
    }

    fn controller_with(
        dir: &Path,
        settings_toml: &str,
    ) -> (Controller<FakeFactory>, Rc<RefCell<Shared>>) {
        let path = dir.join("settings.toml");
        fs::write(&path, settings_toml).unwrap();
        let store = SettingsStore::load(&path).unwrap();
        let shared = Rc::new(RefCell::new(Shared::default()));
        let factory = FakeFactory {
            shared: shared.clone(),
            fail_builds: false,
        };
        (Controller::new(store, factory), shared)
    }

    fn touch_video(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        format!("file://{}", path.display())
    }

    fn enabled_toml(uri: &str) -> String {
        format!(
            "\"video-wallpaper-enabled\" = true\n\"video-wallpaper-uri\" = \"{}\"\n",
            uri
        )
    }

    #[test]
    fn test_start_is_noop_while_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let toml = format!(
            "\"video-wallpaper-enabled\" = false\n\"video-wallpaper-uri\" = \"{}\"\n",
            uri
        );
        let (mut controller, shared) = controller_with(dir.path(), &toml);

        controller.start().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert!(shared.borrow().commands.is_empty());
    }

    #[test]
    fn test_enabling_via_settings_builds_and_plays() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let toml = format!(
            "\"video-wallpaper-enabled\" = false\n\"video-wallpaper-uri\" = \"{}\"\n",
            uri
        );
        let (mut controller, shared) = controller_with(dir.path(), &toml);

        controller.start().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);

        fs::write(dir.path().join("settings.toml"), enabled_toml(&uri)).unwrap();
        controller.on_settings_changed(SettingKey::Enabled).unwrap();

        assert_eq!(controller.phase(), PlaybackPhase::Playing);
        let shared = shared.borrow();
        assert!(matches!(shared.commands[0], FakeCommand::Build { .. }));
        assert_eq!(shared.commands[1], FakeCommand::Play);
    }

    #[test]
    fn test_start_is_noop_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let toml = enabled_toml("file:///nonexistent/video.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &toml);

        controller.start().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert!(shared.borrow().commands.is_empty());
    }

    #[test]
    fn test_start_is_noop_for_empty_uri() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, shared) =
            controller_with(dir.path(), "\"video-wallpaper-enabled\" = true\n");

        controller.start().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert!(shared.borrow().commands.is_empty());
    }

    #[test]
    fn test_set_video_never_leaves_two_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let uri_a = touch_video(dir.path(), "a.mp4");
        let uri_b = touch_video(dir.path(), "b.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri_a));

        controller.start().unwrap();
        controller.set_video(uri_b.clone()).unwrap();
        controller.set_video(uri_a.clone()).unwrap();

        let shared = shared.borrow();
        assert_eq!(shared.max_live, 1);
        assert_eq!(shared.live, 1);
        let last_build = shared
            .commands
            .iter()
            .rev()
            .find_map(|c| match c {
                FakeCommand::Build { location, .. } => Some(location.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(Some(last_build), location_from_uri(&uri_a));
    }

    #[test]
    fn test_set_video_to_missing_file_keeps_old_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));

        controller.start().unwrap();
        controller
            .set_video("file:///nonexistent/b.mp4".to_string())
            .unwrap();

        // Unready configuration is deferred; the old video keeps playing.
        assert_eq!(controller.phase(), PlaybackPhase::Playing);
        assert_eq!(shared.borrow().live, 1);
    }

    #[test]
    fn test_volume_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));
        controller.start().unwrap();

        controller.set_volume(-0.5).unwrap();
        assert_eq!(controller.volume(), 0.0);
        controller.set_volume(2.0).unwrap();
        assert_eq!(controller.volume(), 1.0);

        let shared = shared.borrow();
        assert_eq!(shared.count(&FakeCommand::SetVolume(0.0)), 1);
        assert_eq!(shared.count(&FakeCommand::SetVolume(1.0)), 1);
        // A live volume change never interrupts playback.
        assert_eq!(shared.count(&FakeCommand::Stop), 0);
    }

    #[test]
    fn test_volume_set_before_build_reaches_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let toml = format!(
            "\"video-wallpaper-enabled\" = false\n\"video-wallpaper-uri\" = \"{}\"\n",
            uri
        );
        let (mut controller, shared) = controller_with(dir.path(), &toml);

        controller.set_volume(0.3).unwrap();
        assert!(shared.borrow().commands.is_empty());

        fs::write(dir.path().join("settings.toml"), enabled_toml(&uri)).unwrap();
        controller.on_settings_changed(SettingKey::Enabled).unwrap();

        let shared = shared.borrow();
        assert_eq!(
            shared.commands[0],
            FakeCommand::Build {
                location: location_from_uri(&uri).unwrap(),
                volume: 0.3,
            }
        );
    }

    #[test]
    fn test_end_of_stream_loops_without_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));
        controller.start().unwrap();

        controller.on_pipeline_event(controller.generation(), PipelineEvent::EndOfStream);

        assert_eq!(controller.phase(), PlaybackPhase::Playing);
        let shared = shared.borrow();
        assert_eq!(shared.count(&FakeCommand::SeekToStart), 1);
        assert_eq!(shared.count(&FakeCommand::Stop), 0);
    }

    #[test]
    fn test_end_of_stream_stops_when_loop_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));
        controller.start().unwrap();

        // The flag takes effect at the next end-of-stream.
        controller.set_loop(false);
        controller.on_pipeline_event(controller.generation(), PipelineEvent::EndOfStream);

        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        let shared = shared.borrow();
        assert_eq!(shared.count(&FakeCommand::SeekToStart), 0);
        assert_eq!(shared.count(&FakeCommand::Stop), 1);
        assert_eq!(shared.live, 0);
    }

    #[test]
    fn test_pipeline_error_goes_idle_and_play_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));
        controller.start().unwrap();

        controller.on_pipeline_event(
            controller.generation(),
            PipelineEvent::Error {
                message: "decoder fault".to_string(),
            },
        );
        assert_eq!(controller.phase(), PlaybackPhase::Idle);

        // No auto-retry: play without a pipeline does nothing.
        let plays_before = shared.borrow().count(&FakeCommand::Play);
        controller.play().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert_eq!(shared.borrow().count(&FakeCommand::Play), plays_before);

        // An explicit start rebuilds.
        controller.start().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_stale_generation_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let uri_a = touch_video(dir.path(), "a.mp4");
        let uri_b = touch_video(dir.path(), "b.mp4");
        let (mut controller, _shared) = controller_with(dir.path(), &enabled_toml(&uri_a));

        controller.start().unwrap();
        let old_generation = controller.generation();
        controller.set_video(uri_b).unwrap();

        controller.on_pipeline_event(
            old_generation,
            PipelineEvent::Error {
                message: "late fault from torn-down pipeline".to_string(),
            },
        );
        assert_eq!(controller.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_build_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));
        controller.factory.fail_builds = true;

        assert!(controller.start().is_err());
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert_eq!(shared.borrow().live, 0);
    }

    #[test]
    fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, _shared) = controller_with(dir.path(), &enabled_toml(&uri));

        controller.start().unwrap();
        controller.pause().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Paused);
        controller.play().unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_unrelated_setting_change_does_not_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));
        controller.start().unwrap();

        let toml = format!(
            "{}\"video-wallpaper-loop\" = false\n\"video-wallpaper-volume\" = 0.8\n",
            enabled_toml(&uri)
        );
        fs::write(dir.path().join("settings.toml"), toml).unwrap();
        controller.on_settings_changed(SettingKey::Loop).unwrap();
        controller.on_settings_changed(SettingKey::Volume).unwrap();

        let builds = shared
            .borrow()
            .commands
            .iter()
            .filter(|c| matches!(c, FakeCommand::Build { .. }))
            .count();
        assert_eq!(builds, 1);
        assert_eq!(controller.volume(), 0.8);
        assert!(!controller.loop_enabled);
    }

    #[test]
    fn test_shutdown_event_releases_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let uri = touch_video(dir.path(), "a.mp4");
        let (mut controller, shared) = controller_with(dir.path(), &enabled_toml(&uri));

        controller.start().unwrap();
        controller.handle_event(ControllerEvent::Shutdown).unwrap();

        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert_eq!(shared.borrow().live, 0);
    }
}
