use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Progress of an evaluation pass: per-image detect time and running totals,
/// echoed to the terminal and appended to a run log.
pub struct EvalStats {
    stopwatch: Instant,
    detect_time: Duration,
    num_images: usize,
    images_done: usize,
    detections: usize,
    log_output: String,
    f_handle: File,
}

impl EvalStats {
    /// Opens (or creates) the log at `path` and stamps a new run header.
    pub fn new(path: &Path, num_images: usize, title: &str) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let f_handle = File::options().create(true).append(true).open(path)?;
        let now = Utc::now();

        writeln!(
            &f_handle,
            "\n----{}----\n{}",
            now.format("%Y-%m-%d %H:%M:%S"),
            title
        )?;

        Ok(EvalStats {
            stopwatch: Instant::now(),
            detect_time: Duration::ZERO,
            num_images,
            images_done: 0,
            detections: 0,
            log_output: String::new(),
            f_handle,
        })
    }

    /// Restarts the per-image timer.
    pub fn start(&mut self) {
        self.stopwatch = Instant::now();
    }

    /// Records one finished image.
    pub fn update(&mut self, image_index: usize, detections: usize) -> Result<()> {
        let elapsed = self.stopwatch.elapsed();
        self.detect_time += elapsed;
        self.images_done += 1;
        self.detections += detections;

        self.log_output = format!(
            "testing {}/{} (image {}) detect {:.3}s, dets:{}\r",
            self.images_done,
            self.num_images,
            image_index,
            elapsed.as_secs_f32(),
            self.detections
        );

        print!("{}", &self.log_output);
        std::io::stdout().flush()?;
        tracing::debug!("image {} detected in {:?}", image_index, elapsed);

        Ok(())
    }

    pub fn images_done(&self) -> usize {
        self.images_done
    }

    pub fn detections(&self) -> usize {
        self.detections
    }

    /// Mean detect time per image so far.
    pub fn mean_detect_time(&self) -> Duration {
        if self.images_done == 0 {
            Duration::ZERO
        } else {
            self.detect_time / self.images_done as u32
        }
    }

    /// Writes the last progress line plus `summary` to the log.
    pub fn flush(&mut self, summary: &str) -> Result<()> {
        writeln!(self.f_handle, "{}", self.log_output.trim_end_matches('\r'))?;
        writeln!(self.f_handle, "{summary}")?;
        println!();

        tracing::info!(
            "{} images, {} detections, {:.3}s mean detect time",
            self.images_done,
            self.detections,
            self.mean_detect_time().as_secs_f32()
        );

        Ok(())
    }
}
