use tracing::debug;

use crate::decoder::SharedPcmSink;

/// Linear resampler over interleaved host-order 16 bit samples.
///
/// The factor stabilizes receive buffers against clock drift: factor
/// 1.0 passes through, factor > 1.0 produces more output frames
/// (stretches), factor < 1.0 fewer. Internally the step size is
/// `1.0 / factor`; one input frame of history is kept so interpolation
/// works across write boundaries.
pub struct Resampler {
    sink: SharedPcmSink,
    channels: usize,
    step: f32,
    /// fractional read position relative to `history` + current input
    pos: f32,
    history: Vec<i16>,
}

impl Resampler {
    pub fn new(sink: SharedPcmSink, channels: usize) -> Self {
        Self {
            sink,
            channels: channels.max(1),
            step: 1.0,
            pos: 0.0,
            history: Vec::new(),
        }
    }

    pub fn set_channels(&mut self, channels: usize) {
        self.channels = channels.max(1);
        self.history.clear();
        self.pos = 0.0;
    }

    /// factor <= 0 resets to pass-through
    pub fn set_factor(&mut self, factor: f32) {
        let factor = if factor <= 0.0 { 1.0 } else { factor };
        self.step = 1.0 / factor;
        debug!(factor, step = self.step, "resample factor set");
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f32::EPSILON
    }

    /// Write interleaved 16 bit frames; resampled output goes to the sink
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.is_passthrough() {
            (*self.sink.lock())(data);
            return data.len();
        }

        // collect history + new input as interleaved frames
        let mut samples: Vec<i16> = Vec::with_capacity(self.history.len() + data.len() / 2);
        samples.extend_from_slice(&self.history);
        for pair in data.chunks_exact(2) {
            samples.push(i16::from_ne_bytes([pair[0], pair[1]]));
        }
        let frames = samples.len() / self.channels;
        if frames < 2 {
            self.history = samples;
            return data.len();
        }

        let mut out: Vec<u8> = Vec::new();
        let mut pos = self.pos;
        while (pos as usize) + 1 < frames {
            let base = pos as usize;
            let frac = pos - base as f32;
            for ch in 0..self.channels {
                let a = samples[base * self.channels + ch] as f32;
                let b = samples[(base + 1) * self.channels + ch] as f32;
                let value = (a + (b - a) * frac) as i16;
                out.extend_from_slice(&value.to_ne_bytes());
            }
            pos += self.step;
        }

        // keep the last consumed frame for the next call
        let keep_from = (frames - 1) * self.channels;
        self.pos = pos - (frames - 1) as f32;
        self.history = samples[keep_from..].to_vec();

        (*self.sink.lock())(&out);
        data.len()
    }
}
