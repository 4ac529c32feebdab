use std::f32::consts::TAU;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::notifications::store::{Notification, NotificationSink};

/// Something that can make noise.
pub trait SoundPlayer {
    fn play_file(&mut self, path: &Path, volume: f32) -> Result<()>;

    /// Plays mono samples in `[-1.0, 1.0]`.
    fn play_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// A short sine beep.
#[derive(Clone, Debug, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub duration: Duration,
    pub gain: f32,
    pub sample_rate: u32,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            frequency_hz: 800.0,
            duration: Duration::from_millis(200),
            gain: 0.3,
            sample_rate: 44_100,
        }
    }
}

impl Tone {
    pub fn samples(&self) -> Vec<f32> {
        let count = (self.duration.as_secs_f32() * self.sample_rate as f32).round() as usize;
        (0..count)
            .map(|i| {
                let t = i as f32 / self.sample_rate as f32;
                (TAU * self.frequency_hz * t).sin() * self.gain
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertOutcome {
    Played,
    Synthesized,
    Silent,
}

/// Plays the alert resource, falling back to a synthesized tone, falling
/// back to silence.
pub struct AlertSound<P: SoundPlayer> {
    player: P,
    resource: PathBuf,
    volume: f32,
    tone: Tone,
}

impl<P: SoundPlayer> AlertSound<P> {
    pub fn new(player: P, resource: impl Into<PathBuf>) -> Self {
        Self {
            player,
            resource: resource.into(),
            volume: 0.5,
            tone: Tone::default(),
        }
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = tone;
        self
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn ring(&mut self) -> AlertOutcome {
        let played = self.player.play_file(&self.resource, self.volume);
        let Err(file_error) = played else {
            return AlertOutcome::Played;
        };
        log::debug!(
            "Alert sound {} failed ({}), synthesizing tone",
            self.resource.display(),
            file_error
        );

        let samples = self.tone.samples();
        match self.player.play_samples(&samples, self.tone.sample_rate) {
            Ok(()) => AlertOutcome::Synthesized,
            Err(tone_error) => {
                log::warn!("Audio play failed: {}; {}", file_error, tone_error);
                AlertOutcome::Silent
            }
        }
    }
}

impl<P: SoundPlayer> NotificationSink for AlertSound<P> {
    fn on_notification(&mut self, _notification: &Notification) {
        self.ring();
    }
}

/// Rings the terminal bell. It can't decode audio files, so alerts always
/// take the tone path.
pub struct BellPlayer<W: Write> {
    out: W,
}

impl<W: Write> BellPlayer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl BellPlayer<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write> SoundPlayer for BellPlayer<W> {
    fn play_file(&mut self, path: &Path, _volume: f32) -> Result<()> {
        anyhow::bail!("terminal can't play {}", path.display())
    }

    fn play_samples(&mut self, samples: &[f32], _sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.out.write_all(b"\x07")?;
        self.out.flush()?;
        Ok(())
    }
}

/// No audio device.
pub struct SilentPlayer;

impl SoundPlayer for SilentPlayer {
    fn play_file(&mut self, _path: &Path, _volume: f32) -> Result<()> {
        anyhow::bail!("no audio device")
    }

    fn play_samples(&mut self, _samples: &[f32], _sample_rate: u32) -> Result<()> {
        anyhow::bail!("no audio device")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakePlayer {
        file_works: bool,
        files: Vec<(PathBuf, f32)>,
        tones: Vec<usize>,
    }

    impl SoundPlayer for FakePlayer {
        fn play_file(&mut self, path: &Path, volume: f32) -> Result<()> {
            if !self.file_works {
                anyhow::bail!("autoplay blocked");
            }
            self.files.push((path.to_path_buf(), volume));
            Ok(())
        }

        fn play_samples(&mut self, samples: &[f32], _sample_rate: u32) -> Result<()> {
            self.tones.push(samples.len());
            Ok(())
        }
    }

    #[test]
    fn plays_the_resource_at_half_volume() {
        let player = FakePlayer {
            file_works: true,
            ..Default::default()
        };
        let mut alert = AlertSound::new(player, "notification.mp3");
        assert_eq!(alert.ring(), AlertOutcome::Played);
        assert_eq!(alert.player().files, vec![(PathBuf::from("notification.mp3"), 0.5)]);
        assert!(alert.player().tones.is_empty());
    }

    #[test]
    fn falls_back_to_a_tone() {
        let mut alert = AlertSound::new(FakePlayer::default(), "notification.mp3");
        assert_eq!(alert.ring(), AlertOutcome::Synthesized);
        // 200 ms at 44.1 kHz.
        assert_eq!(alert.player().tones, vec![8820]);
    }

    #[test]
    fn double_failure_is_silent() {
        let mut alert = AlertSound::new(SilentPlayer, "notification.mp3");
        assert_eq!(alert.ring(), AlertOutcome::Silent);
    }

    #[test]
    fn bell_writes_bel() {
        let mut alert = AlertSound::new(BellPlayer::new(Vec::new()), "notification.mp3");
        assert_eq!(alert.ring(), AlertOutcome::Synthesized);
        let AlertSound { player, .. } = alert;
        assert_eq!(player.into_inner(), b"\x07");
    }

    #[test]
    fn tone_stays_within_gain() {
        let samples = Tone::default().samples();
        assert!(samples.iter().all(|s| s.abs() <= 0.3 + f32::EPSILON));
        assert!(samples.iter().any(|s| s.abs() > 0.2));
    }
}
