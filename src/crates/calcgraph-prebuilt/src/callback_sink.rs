//! A sink that hands every packet to a user-supplied callback.

use async_trait::async_trait;
use calcgraph_core::{
    Calculator, CalculatorContext, CalculatorContract, InputPolicy, PacketType, Result,
};
use calcgraph_core::Packet;
use std::sync::Arc;

/// The typed sink interface consumed by [`CallbackSink`]: wrap a closure in
/// an `Arc` and pass it as the `CALLBACK` input side packet.
pub type SinkCallback = Arc<dyn Fn(&Packet) -> Result<()> + Send + Sync>;

/// Builds a [`SinkCallback`] side packet from a closure.
pub fn sink_callback(f: impl Fn(&Packet) -> Result<()> + Send + Sync + 'static) -> Packet {
    Packet::new::<SinkCallback>(Arc::new(f))
}

/// Delivers each arriving packet to the `CALLBACK` side packet, in stream
/// order, as soon as it arrives (immediate policy, no synchronization).
/// Errors returned by the callback fail the run like any calculator error.
///
/// For observation wired programmatically rather than through the graph
/// configuration, prefer `CalculatorGraph::observe_output_stream`.
#[derive(Default)]
pub struct CallbackSink {
    callback: Option<SinkCallback>,
}

#[async_trait]
impl Calculator for CallbackSink {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        contract.set_all_input_types(PacketType::Any);
        contract.require_input_side_packet("CALLBACK", PacketType::of::<SinkCallback>())?;
        contract.set_input_policy(InputPolicy::Immediate);
        Ok(())
    }

    async fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        self.callback = Some(ctx.input_side_packet("CALLBACK").get::<SinkCallback>().clone());
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let callback = self.callback.as_ref().expect("bound in open");
        for input in ctx.inputs() {
            let packet = input.value();
            if !packet.is_empty() {
                callback(packet)?;
            }
        }
        Ok(())
    }
}
