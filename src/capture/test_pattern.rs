//! Synthetic capture source: scrolling colour bars

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{CaptureHandle, CaptureSettings, CaptureSource, FrameRateRange};
use crate::error::{Result, StreamError};
use crate::video::format::{ColorRange, PixelLayout, Resolution};
use crate::video::frame::VideoFrame;

/// 75% SMPTE-style bars as (R, G, B)
const BARS: [(u8, u8, u8); 8] = [
    (191, 191, 191),
    (191, 191, 0),
    (0, 191, 191),
    (0, 191, 0),
    (191, 0, 191),
    (191, 0, 0),
    (0, 0, 191),
    (0, 0, 0),
];

/// Horizontal scroll per frame, in pixels
const SCROLL_STEP: u32 = 4;

/// Rates the pattern generator advertises
const SUPPORTED_RATES: [f64; 8] = [15.0, 24.0, 25.0, 29.97, 30.0, 50.0, 59.94, 60.0];

struct Running {
    stop_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Generates moving colour bars on a blocking thread
pub struct TestPatternSource {
    name: String,
    layout: PixelLayout,
    running: Mutex<Option<Running>>,
}

impl TestPatternSource {
    pub fn new(name: impl Into<String>, layout: PixelLayout) -> Result<Self> {
        if !matches!(
            layout,
            PixelLayout::Bgra | PixelLayout::I420(_) | PixelLayout::Nv12(_)
        ) {
            return Err(StreamError::UnsupportedLayout(layout.to_string()));
        }
        Ok(Self {
            name: name.into(),
            layout,
            running: Mutex::new(None),
        })
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }
}

#[async_trait]
impl CaptureSource for TestPatternSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authorize(&self) -> Result<()> {
        Ok(())
    }

    fn supported_frame_rates(&self) -> Vec<FrameRateRange> {
        SUPPORTED_RATES.iter().map(|&fps| FrameRateRange::exact(fps)).collect()
    }

    async fn start(&self, settings: CaptureSettings, handle: CaptureHandle) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Test pattern already running");
            return Ok(());
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let layout = self.layout;
        let task = tokio::task::spawn_blocking(move || {
            generate_loop(settings, layout, handle, &flag);
        });

        info!(
            "Test pattern started: {} {} @ {} fps",
            settings.resolution, layout, settings.frame_rate
        );
        *running = Some(Running { stop_flag, task });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.stop_flag.store(true, Ordering::SeqCst);
            running.task.await.map_err(|e| StreamError::Capture {
                source_name: self.name.clone(),
                reason: format!("generator thread failed: {}", e),
            })?;
            info!("Test pattern stopped");
        }
        Ok(())
    }
}

fn generate_loop(settings: CaptureSettings, layout: PixelLayout, handle: CaptureHandle, stop_flag: &AtomicBool) {
    let rate = settings.frame_rate;
    let frame_nanos = |index: u64| {
        (index as u128 * 1_000_000_000 * rate.denominator as u128 / rate.numerator.max(1) as u128) as u64
    };
    let start = Instant::now();
    let mut index: u64 = 0;

    while !stop_flag.load(Ordering::Relaxed) {
        let pts = Duration::from_nanos(frame_nanos(index));
        let deadline = start + pts;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        let offset = (index as u32).wrapping_mul(SCROLL_STEP);
        let data = render(settings.resolution, layout, offset);
        let frame = VideoFrame::from_vec(data, settings.resolution, layout, index).with_pts(pts);
        handle.on_frame(frame);
        index += 1;
    }

    debug!("Test pattern generator exited after {} frames", index);
}

/// Render one frame with the bars shifted left by `offset` pixels
pub fn render(resolution: Resolution, layout: PixelLayout, offset: u32) -> Vec<u8> {
    let w = resolution.width as usize;
    let h = resolution.height as usize;
    let bar_width = (w / BARS.len()).max(1);
    let bar_at = |x: usize| BARS[((x + offset as usize) / bar_width) % BARS.len()];

    match layout {
        PixelLayout::Bgra => {
            let mut row = Vec::with_capacity(w * 4);
            for x in 0..w {
                let (r, g, b) = bar_at(x);
                row.extend_from_slice(&[b, g, r, 255]);
            }
            row.repeat(h)
        }
        PixelLayout::I420(range) | PixelLayout::Nv12(range) => {
            let cw = w.div_ceil(2);
            let ch = h.div_ceil(2);
            let stride = layout.min_stride(resolution.width).unwrap_or(resolution.width) as usize;
            let mut y_row: Vec<u8> = (0..w).map(|x| ycbcr(bar_at(x), range).0).collect();
            y_row.resize(stride, 16);
            let chroma: Vec<(u8, u8)> = (0..cw)
                .map(|cx| {
                    let (_, cb, cr) = ycbcr(bar_at(cx * 2), range);
                    (cb, cr)
                })
                .collect();

            let mut data = y_row.repeat(h);
            if matches!(layout, PixelLayout::I420(_)) {
                let u_row: Vec<u8> = chroma.iter().map(|c| c.0).collect();
                let v_row: Vec<u8> = chroma.iter().map(|c| c.1).collect();
                data.extend(u_row.repeat(ch));
                data.extend(v_row.repeat(ch));
            } else {
                // NV12 chroma rows share the luma stride, which holds every pair
                let mut uv_row = Vec::with_capacity(stride);
                for &(cb, cr) in &chroma {
                    uv_row.extend_from_slice(&[cb, cr]);
                }
                data.extend(uv_row.repeat(ch));
            }
            data
        }
        PixelLayout::Other(_) => Vec::new(),
    }
}

/// BT.601 RGB → YCbCr; only luma is range-compressed, matching the converter
fn ycbcr((r, g, b): (u8, u8, u8), range: ColorRange) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = (b - y) / 1.772;
    let cr = (r - y) / 1.402;
    let (offset, scale) = range.luma_offset_scale();
    let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    (clamp(offset + y / scale), clamp(128.0 + cb), clamp(128.0 + cr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::convert::PixelConverter;

    #[test]
    fn test_render_sizes_match_layout() {
        let res = Resolution::new(64, 48);
        for layout in [
            PixelLayout::Bgra,
            PixelLayout::I420(ColorRange::Video),
            PixelLayout::Nv12(ColorRange::Full),
        ] {
            let data = render(res, layout, 0);
            let stride = layout.min_stride(res.width).unwrap();
            assert_eq!(Some(data.len()), layout.frame_size(stride, res.height), "{}", layout);
        }
    }

    #[test]
    fn test_odd_resolutions_render_and_convert() {
        let res = Resolution::new(17, 15);
        let mut converter = PixelConverter::new();
        for layout in [
            PixelLayout::I420(ColorRange::Video),
            PixelLayout::Nv12(ColorRange::Video),
            PixelLayout::Nv12(ColorRange::Full),
        ] {
            let data = render(res, layout, 0);
            let stride = layout.min_stride(res.width).unwrap();
            assert_eq!(Some(data.len()), layout.frame_size(stride, res.height), "{}", layout);

            let frame = VideoFrame::from_vec(data, res, layout, 0);
            let out = converter.convert(&frame).unwrap();
            assert_eq!(out.data.len(), 17 * 15 * 4, "{}", layout);
        }
    }

    #[test]
    fn test_yuv_pattern_converts_back_to_bars() {
        let res = Resolution::new(64, 16);
        let frame = VideoFrame::from_vec(
            render(res, PixelLayout::I420(ColorRange::Video), 0),
            res,
            PixelLayout::I420(ColorRange::Video),
            0,
        );
        let mut converter = PixelConverter::new();
        let out = converter.convert(&frame).unwrap();

        // Centre of the first (grey) and sixth (red) bar
        let px = |x: usize| &out.data[x * 4..x * 4 + 4];
        for (x, (r, g, b)) in [(4usize, BARS[0]), (44, BARS[5])] {
            let p = px(x);
            assert!((p[2] as i32 - r as i32).abs() <= 3, "red at {}: {:?}", x, p);
            assert!((p[1] as i32 - g as i32).abs() <= 3, "green at {}: {:?}", x, p);
            assert!((p[0] as i32 - b as i32).abs() <= 3, "blue at {}: {:?}", x, p);
        }
    }

    #[test]
    fn test_offset_scrolls() {
        let res = Resolution::new(16, 2);
        let a = render(res, PixelLayout::Bgra, 0);
        let b = render(res, PixelLayout::Bgra, 2);
        assert_eq!(&a[2 * 4..3 * 4], &b[0..4]);
    }

    #[test]
    fn test_rejects_unknown_layout() {
        assert!(TestPatternSource::new("x", PixelLayout::Other(*b"MJPG")).is_err());
    }
}
