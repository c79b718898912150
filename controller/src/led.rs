use anyhow::anyhow;
use esp_idf_hal::{gpio::OutputPin, peripheral::Peripheral, rmt::RmtChannel};
use log::warn;
use smart_leds_trait::{SmartLedsWrite, RGB8};
use ws2812_esp32_rmt_driver::Ws2812Esp32Rmt;

use wordclock_common::{
    indicator_frame, ring_frame, Color, NetworkIndicator, RenderInstruction, RenderSink,
    RING_PIXELS,
};

/// WS2812 ring of sixty pixels driven over one RMT channel.
pub struct LedRing {
    driver: Ws2812Esp32Rmt<'static>,
}

impl LedRing {
    pub fn new<C: RmtChannel>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> anyhow::Result<Self> {
        let driver = Ws2812Esp32Rmt::new(channel, pin)
            .map_err(|err| anyhow!("failed to set up WS2812 RMT driver: {err:?}"))?;
        Ok(Self { driver })
    }

    fn push(&mut self, frame: &[Color; RING_PIXELS]) {
        let pixels = frame
            .iter()
            .map(|color| RGB8::new(color.red, color.green, color.blue));
        if let Err(err) = self.driver.write(pixels) {
            warn!("failed to push LED frame: {err:?}");
        }
    }
}

impl RenderSink for LedRing {
    fn apply(&mut self, instruction: &RenderInstruction) {
        self.push(&ring_frame(instruction));
    }

    fn indicate(&mut self, indicator: NetworkIndicator) {
        self.push(&indicator_frame(indicator));
    }
}
