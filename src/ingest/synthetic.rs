use crate::error::IngestError;
use crate::ingest::decoder::{DecodedFrame, FrameDecoder};
use std::time::{Duration, Instant};

/// Frame source that synthesizes a moving test pattern.
///
/// Used by tests and demo setups in place of a real decoder backend
/// (`synthetic://` URLs). Frames are paced at the requested rate.
pub struct SyntheticDecoder {
    width: u32,
    height: u32,
    frame_interval: Duration,
    opened: bool,
    tick: u64,
    last_frame: Option<Instant>,
    /// When set, `open` fails this many times before succeeding
    fail_opens: u32,
    /// When set, `read` disconnects after this many frames
    fail_after: Option<u64>,
}

impl SyntheticDecoder {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            opened: false,
            tick: 0,
            last_frame: None,
            fail_opens: 0,
            fail_after: None,
        }
    }

    /// Fail the first `n` open attempts (reconnect testing)
    pub fn with_failing_opens(mut self, n: u32) -> Self {
        self.fail_opens = n;
        self
    }

    /// Disconnect after producing `n` frames (reconnect testing)
    pub fn with_disconnect_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    fn render(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.width as usize * self.height as usize * 3];
        let shift = (self.tick % 256) as u8;
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                let i = (y * self.width as usize + x) * 3;
                data[i] = (x as u8).wrapping_add(shift);
                data[i + 1] = (y as u8).wrapping_add(shift);
                data[i + 2] = shift;
            }
        }
        data
    }
}

impl FrameDecoder for SyntheticDecoder {
    fn open(&mut self) -> Result<(), IngestError> {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(IngestError::SourceOpen {
                url: "synthetic://".to_string(),
                details: "simulated open failure".to_string(),
            });
        }
        self.opened = true;
        self.last_frame = None;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<DecodedFrame, IngestError> {
        if !self.opened {
            return Err(IngestError::Disconnected);
        }
        if let Some(limit) = self.fail_after {
            if self.tick >= limit {
                return Err(IngestError::Disconnected);
            }
        }

        // Pace output to the configured frame rate
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                let wait = self.frame_interval - elapsed;
                if wait > timeout {
                    return Err(IngestError::FrameTimeout { timeout });
                }
                std::thread::sleep(wait);
            }
        }
        self.last_frame = Some(Instant::now());
        self.tick += 1;

        Ok(DecodedFrame {
            data: self.render(),
            width: self.width,
            height: self.height,
        })
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produces_frames_after_open() {
        let mut dec = SyntheticDecoder::new(32, 24, 100);
        assert!(dec.read(Duration::from_secs(1)).is_err());

        dec.open().unwrap();
        let frame = dec.read(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert_eq!(frame.data.len(), 32 * 24 * 3);
    }

    #[test]
    fn test_pattern_changes_between_frames() {
        let mut dec = SyntheticDecoder::new(16, 16, 1000);
        dec.open().unwrap();
        let a = dec.read(Duration::from_secs(1)).unwrap();
        let b = dec.read(Duration::from_secs(1)).unwrap();
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_simulated_open_failures() {
        let mut dec = SyntheticDecoder::new(8, 8, 100).with_failing_opens(2);
        assert!(dec.open().is_err());
        assert!(dec.open().is_err());
        assert!(dec.open().is_ok());
    }

    #[test]
    fn test_simulated_disconnect() {
        let mut dec = SyntheticDecoder::new(8, 8, 1000).with_disconnect_after(2);
        dec.open().unwrap();
        assert!(dec.read(Duration::from_secs(1)).is_ok());
        assert!(dec.read(Duration::from_secs(1)).is_ok());
        assert!(matches!(
            dec.read(Duration::from_secs(1)),
            Err(IngestError::Disconnected)
        ));
    }
}
