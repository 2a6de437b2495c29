use crate::error::MixerError;
use crate::graph::AudioGraph;

/// Centre value of unsigned 8-bit time-domain samples.
pub const MIDPOINT: u8 = 128;

/// Analysis tap on the mixed output.
///
/// A source node wraps the destination's output stream and feeds an analyser,
/// so the level reflects the mix rather than any single input. The sample
/// buffer is allocated once and reused for every read.
pub(crate) struct LevelMeter<G: AudioGraph> {
    source: G::Source,
    analyser: G::Analyser,
    samples: Vec<u8>,
}

impl<G: AudioGraph> LevelMeter<G> {
    /// Build the tap and connect source→analyser.
    pub(crate) fn attach(graph: &G, output: &G::Stream, fft_size: u32) -> Result<Self, MixerError> {
        let source = graph.create_source(output)?;
        let analyser = graph.create_analyser(fft_size)?;
        graph.connect(source.as_ref(), analyser.as_ref())?;
        let samples = vec![MIDPOINT; graph.sample_count(&analyser)];
        tracing::debug!(samples = samples.len(), "level meter attached to mixed output");
        Ok(Self {
            source,
            analyser,
            samples,
        })
    }

    /// Sample the analyser and return the peak level as a percentage.
    pub(crate) fn level(&mut self, graph: &G) -> u8 {
        graph.read_time_domain(&self.analyser, &mut self.samples);
        let level = peak_percent(&self.samples);
        tracing::trace!(level, "mixed output level");
        level
    }

    pub(crate) fn detach(&self, graph: &G) -> Result<(), MixerError> {
        graph.disconnect(self.source.as_ref(), self.analyser.as_ref())
    }
}

/// Peak deviation from [`MIDPOINT`] scaled to 0..=100 (floored).
pub fn peak_percent(samples: &[u8]) -> u8 {
    let peak = samples
        .iter()
        .map(|&sample| sample.abs_diff(MIDPOINT))
        .max()
        .unwrap_or(0);
    let percent = u16::from(peak) * 100 / u16::from(MIDPOINT);
    u8::try_from(percent).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(peak_percent(&[MIDPOINT; 1024]), 0);
        assert_eq!(peak_percent(&[]), 0);
    }

    #[test]
    fn test_full_scale() {
        // 0 sits a full MIDPOINT below centre; 255 only reaches 127 above it.
        assert_eq!(peak_percent(&[128, 0, 128]), 100);
        assert_eq!(peak_percent(&[128, 255]), 99);
    }

    #[test]
    fn test_peak_uses_largest_deviation() {
        // |192 - 128| = 64 -> 50%, |100 - 128| = 28 is smaller
        assert_eq!(peak_percent(&[128, 100, 192, 130]), 50);
        // 1 / 128 * 100 = 0.78 floors to 0
        assert_eq!(peak_percent(&[129]), 0);
        // 2 / 128 * 100 = 1.56 floors to 1
        assert_eq!(peak_percent(&[126]), 1);
    }

    #[test]
    fn test_always_in_range() {
        for value in 0..=u8::MAX {
            assert!(peak_percent(&[value]) <= 100);
        }
    }
}
