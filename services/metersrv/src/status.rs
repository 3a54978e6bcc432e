//! Eight-pixel status indicator
//!
//! Pixel 0 shows service health, pixel 1 the cycle state and pixel 2 a
//! successful read. [`StatusPanel`] maps service events onto pixels; the
//! [`StatusIndicator`] implementations only push frames somewhere.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{IndicatorKind, StatusConfig};
use crate::error::{MeterSrvError, Result};

pub const PIXEL_COUNT: usize = 8;

/// Named indicator colours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colour {
    Red,
    Green,
    Blue,
    Yellow,
    Cyan,
    Magenta,
    White,
    #[default]
    Off,
}

impl Colour {
    pub const ALL: [Colour; 8] = [
        Colour::Red,
        Colour::Green,
        Colour::Blue,
        Colour::Yellow,
        Colour::Cyan,
        Colour::Magenta,
        Colour::White,
        Colour::Off,
    ];

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Colour::Red => (200, 0, 0),
            Colour::Green => (0, 200, 0),
            Colour::Blue => (0, 0, 200),
            Colour::Yellow => (200, 200, 0),
            Colour::Cyan => (0, 200, 200),
            Colour::Magenta => (200, 0, 200),
            Colour::White => (200, 200, 200),
            Colour::Off => (0, 0, 0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Colour::Red => "red",
            Colour::Green => "green",
            Colour::Blue => "blue",
            Colour::Yellow => "yellow",
            Colour::Cyan => "cyan",
            Colour::Magenta => "magenta",
            Colour::White => "white",
            Colour::Off => "off",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// RGB scaled by a 0.0..=1.0 brightness
    pub fn scaled(&self, brightness: f32) -> (u8, u8, u8) {
        let scale = |v: u8| (f32::from(v) * brightness.clamp(0.0, 1.0)).round() as u8;
        let (r, g, b) = self.rgb();
        (scale(r), scale(g), scale(b))
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn check_pixel(pixel: usize) -> Result<()> {
    if pixel >= PIXEL_COUNT {
        return Err(MeterSrvError::indicator(format!(
            "pixel {} out of range 0..{}",
            pixel,
            PIXEL_COUNT - 1
        )));
    }
    Ok(())
}

/// Indicator driver
#[async_trait]
pub trait StatusIndicator: Send {
    /// Stage a pixel change; visible after [`show`](Self::show)
    async fn set(&mut self, pixel: usize, colour: Colour) -> Result<()>;

    /// Push staged changes out
    async fn show(&mut self) -> Result<()>;

    /// Stage every pixel off
    async fn clear(&mut self) -> Result<()>;
}

/// Frame buffer that logs each shown frame
#[derive(Debug)]
pub struct LogIndicator {
    frame: [Colour; PIXEL_COUNT],
    brightness: f32,
}

impl LogIndicator {
    pub fn new(brightness: f32) -> Self {
        Self {
            frame: [Colour::Off; PIXEL_COUNT],
            brightness,
        }
    }

    pub fn frame(&self) -> &[Colour; PIXEL_COUNT] {
        &self.frame
    }
}

#[async_trait]
impl StatusIndicator for LogIndicator {
    async fn set(&mut self, pixel: usize, colour: Colour) -> Result<()> {
        check_pixel(pixel)?;
        self.frame[pixel] = colour;
        Ok(())
    }

    async fn show(&mut self) -> Result<()> {
        let pixels: Vec<String> = self
            .frame
            .iter()
            .take(3)
            .map(|c| {
                let (r, g, b) = c.scaled(self.brightness);
                format!("{}({},{},{})", c, r, g, b)
            })
            .collect();
        debug!("Status {}", pixels.join(" "));
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.frame = [Colour::Off; PIXEL_COUNT];
        Ok(())
    }
}

/// Indicator that does nothing
#[derive(Debug, Default)]
pub struct NullIndicator;

#[async_trait]
impl StatusIndicator for NullIndicator {
    async fn set(&mut self, pixel: usize, _colour: Colour) -> Result<()> {
        check_pixel(pixel)
    }

    async fn show(&mut self) -> Result<()> {
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives an external helper as `<program> <pixel> <colour>`
///
/// Only pixels changed since the last `show()` are sent.
#[derive(Debug)]
pub struct CommandIndicator {
    program: PathBuf,
    frame: [Colour; PIXEL_COUNT],
    dirty: [bool; PIXEL_COUNT],
}

impl CommandIndicator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            frame: [Colour::Off; PIXEL_COUNT],
            dirty: [false; PIXEL_COUNT],
        }
    }
}

#[async_trait]
impl StatusIndicator for CommandIndicator {
    async fn set(&mut self, pixel: usize, colour: Colour) -> Result<()> {
        check_pixel(pixel)?;
        self.frame[pixel] = colour;
        self.dirty[pixel] = true;
        Ok(())
    }

    async fn show(&mut self) -> Result<()> {
        for pixel in 0..PIXEL_COUNT {
            if !self.dirty[pixel] {
                continue;
            }
            let colour = self.frame[pixel];
            let status = tokio::process::Command::new(&self.program)
                .arg(pixel.to_string())
                .arg(colour.name())
                .status()
                .await
                .map_err(|e| {
                    MeterSrvError::indicator(format!("{}: {}", self.program.display(), e))
                })?;
            if !status.success() {
                return Err(MeterSrvError::indicator(format!(
                    "{} {} {} exited with {}",
                    self.program.display(),
                    pixel,
                    colour,
                    status
                )));
            }
            self.dirty[pixel] = false;
        }
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        for pixel in 0..PIXEL_COUNT {
            if self.frame[pixel] != Colour::Off {
                self.frame[pixel] = Colour::Off;
                self.dirty[pixel] = true;
            }
        }
        Ok(())
    }
}

/// One call observed by a [`RecordingIndicator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorEvent {
    Set(usize, Colour),
    Show,
    Clear,
}

#[derive(Debug, Default)]
struct Recording {
    events: Vec<IndicatorEvent>,
    staged: [Colour; PIXEL_COUNT],
    shown: Vec<[Colour; PIXEL_COUNT]>,
}

/// Captures every call; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct RecordingIndicator {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IndicatorEvent> {
        self.inner.lock().events.clone()
    }

    /// Every frame passed to `show()`, oldest first
    pub fn frames(&self) -> Vec<[Colour; PIXEL_COUNT]> {
        self.inner.lock().shown.clone()
    }

    /// The frame currently visible
    pub fn current(&self) -> [Colour; PIXEL_COUNT] {
        self.inner
            .lock()
            .shown
            .last()
            .copied()
            .unwrap_or([Colour::Off; PIXEL_COUNT])
    }
}

#[async_trait]
impl StatusIndicator for RecordingIndicator {
    async fn set(&mut self, pixel: usize, colour: Colour) -> Result<()> {
        check_pixel(pixel)?;
        let mut inner = self.inner.lock();
        inner.events.push(IndicatorEvent::Set(pixel, colour));
        inner.staged[pixel] = colour;
        Ok(())
    }

    async fn show(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.events.push(IndicatorEvent::Show);
        let frame = inner.staged;
        inner.shown.push(frame);
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.events.push(IndicatorEvent::Clear);
        inner.staged = [Colour::Off; PIXEL_COUNT];
        Ok(())
    }
}

/// Build the configured indicator
pub fn indicator_from_config(config: &StatusConfig) -> Result<Box<dyn StatusIndicator>> {
    Ok(match config.indicator {
        IndicatorKind::Log => Box::new(LogIndicator::new(config.brightness)),
        IndicatorKind::None => Box::new(NullIndicator),
        IndicatorKind::Command => {
            let program = config.command.clone().ok_or_else(|| {
                MeterSrvError::indicator("status.command is required for the command indicator")
            })?;
            Box::new(CommandIndicator::new(program))
        },
    })
}

/// Which fatal pattern to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Device, transport or bus failure
    Transport,
    Storage,
    Other,
}

impl From<&MeterSrvError> for FatalKind {
    fn from(err: &MeterSrvError) -> Self {
        match err {
            MeterSrvError::DeviceNotFound(_)
            | MeterSrvError::Transport(_)
            | MeterSrvError::BusTimeout { .. }
            | MeterSrvError::BusLock(_) => FatalKind::Transport,
            MeterSrvError::Storage(_) => FatalKind::Storage,
            _ => FatalKind::Other,
        }
    }
}

const HEALTH: usize = 0;
const CYCLE: usize = 1;
const READ: usize = 2;

/// Maps service events to pixel patterns
///
/// Indicator failures are logged and swallowed here, so a broken LED
/// never stops acquisition.
pub struct StatusPanel {
    indicator: Box<dyn StatusIndicator>,
}

impl StatusPanel {
    pub fn new(indicator: Box<dyn StatusIndicator>) -> Self {
        Self { indicator }
    }

    async fn apply(&mut self, event: &str, pixels: &[(usize, Colour)]) {
        for &(pixel, colour) in pixels {
            if let Err(e) = self.indicator.set(pixel, colour).await {
                warn!("Status {}: {}", event, e);
                return;
            }
        }
        if let Err(e) = self.indicator.show().await {
            warn!("Status {}: {}", event, e);
        }
    }

    pub async fn startup(&mut self) {
        if let Err(e) = self.indicator.clear().await {
            warn!("Status startup: {}", e);
        }
        self.apply("startup", &[(HEALTH, Colour::Magenta)]).await;
    }

    pub async fn cycle_start(&mut self) {
        self.apply("cycle-start", &[(CYCLE, Colour::Blue)]).await;
    }

    pub async fn bus_wait(&mut self) {
        self.apply("bus-wait", &[(CYCLE, Colour::Yellow)]).await;
    }

    pub async fn bus_error(&mut self) {
        self.apply("bus-error", &[(CYCLE, Colour::Red)]).await;
    }

    pub async fn read_success(&mut self) {
        self.apply("read-success", &[(READ, Colour::Green)]).await;
    }

    /// Reading written; back to idle
    pub async fn appended(&mut self) {
        self.apply("appended", &[(CYCLE, Colour::Off), (READ, Colour::Off)])
            .await;
    }

    pub async fn read_failure(&mut self) {
        self.apply("read-failure", &[(CYCLE, Colour::Red)]).await;
    }

    pub async fn fatal(&mut self, kind: FatalKind) {
        info!("Showing fatal status ({:?})", kind);
        let pattern = match kind {
            FatalKind::Transport => [Colour::Red, Colour::Red, Colour::Off],
            FatalKind::Storage => [Colour::Red, Colour::Off, Colour::Red],
            FatalKind::Other => [Colour::Red, Colour::Off, Colour::Off],
        };
        self.apply(
            "fatal",
            &[
                (HEALTH, pattern[0]),
                (CYCLE, pattern[1]),
                (READ, pattern[2]),
            ],
        )
        .await;
    }
}

impl fmt::Debug for StatusPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusPanel").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::error::{StorageError, TransportError};
    use std::time::Duration;

    #[test]
    fn test_colour_table() {
        assert_eq!(Colour::Red.rgb(), (200, 0, 0));
        assert_eq!(Colour::Magenta.rgb(), (200, 0, 200));
        assert_eq!(Colour::Off.rgb(), (0, 0, 0));
        assert_eq!(Colour::from_name("Cyan"), Some(Colour::Cyan));
        assert_eq!(Colour::from_name(" white "), Some(Colour::White));
        assert_eq!(Colour::from_name("purple"), None);
        assert_eq!(Colour::Red.scaled(0.1), (20, 0, 0));
        assert_eq!(Colour::White.scaled(2.0), (200, 200, 200));
    }

    #[tokio::test]
    async fn test_pixel_out_of_range_rejected() {
        let mut indicator = RecordingIndicator::new();
        assert!(indicator.set(7, Colour::Red).await.is_ok());
        assert!(matches!(
            indicator.set(8, Colour::Red).await,
            Err(MeterSrvError::Indicator(_))
        ));

        let mut log = LogIndicator::new(0.1);
        assert!(log.set(8, Colour::Red).await.is_err());
        assert!(NullIndicator.set(8, Colour::Red).await.is_err());
    }

    #[tokio::test]
    async fn test_cycle_transitions() {
        let recorder = RecordingIndicator::new();
        let mut panel = StatusPanel::new(Box::new(recorder.clone()));

        panel.startup().await;
        assert_eq!(recorder.current()[0], Colour::Magenta);

        panel.cycle_start().await;
        assert_eq!(recorder.current()[1], Colour::Blue);

        panel.read_success().await;
        assert_eq!(recorder.current()[..3], [Colour::Magenta, Colour::Blue, Colour::Green]);

        panel.appended().await;
        assert_eq!(recorder.current()[..3], [Colour::Magenta, Colour::Off, Colour::Off]);

        panel.bus_wait().await;
        assert_eq!(recorder.current()[1], Colour::Yellow);
        panel.bus_error().await;
        assert_eq!(recorder.current()[1], Colour::Red);
    }

    #[tokio::test]
    async fn test_fatal_patterns() {
        let recorder = RecordingIndicator::new();
        let mut panel = StatusPanel::new(Box::new(recorder.clone()));

        let transport = MeterSrvError::Transport(TransportError::Timeout(Duration::from_secs(1)));
        panel.fatal(FatalKind::from(&transport)).await;
        assert_eq!(recorder.current()[..3], [Colour::Red, Colour::Red, Colour::Off]);

        let storage = MeterSrvError::Storage(StorageError::Closed);
        panel.fatal(FatalKind::from(&storage)).await;
        assert_eq!(recorder.current()[..3], [Colour::Red, Colour::Off, Colour::Red]);

        panel.fatal(FatalKind::Other).await;
        assert_eq!(recorder.current()[..3], [Colour::Red, Colour::Off, Colour::Off]);
    }

    #[tokio::test]
    async fn test_command_indicator_failure_is_contained() {
        let mut panel = StatusPanel::new(Box::new(CommandIndicator::new(
            "/nonexistent/metersrv-status-helper",
        )));
        // must not panic or propagate
        panel.startup().await;
        panel.cycle_start().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_indicator_sends_changed_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.txt");
        let script = dir.path().join("helper.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1 $2\" >> {}\n", log.display()),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut indicator = CommandIndicator::new(&script);
        indicator.set(1, Colour::Blue).await.unwrap();
        indicator.set(2, Colour::Green).await.unwrap();
        indicator.show().await.unwrap();
        // nothing staged, nothing sent
        indicator.show().await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls, "1 blue\n2 green\n");
    }
}
