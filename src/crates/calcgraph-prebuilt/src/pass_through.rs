//! Verbatim forwarding of inputs to outputs.

use async_trait::async_trait;
use calcgraph_core::{
    Calculator, CalculatorContext, CalculatorContract, GraphError, PacketType, Result,
};

/// Copies the packet on input port `i` to output port `i`, preserving
/// payloads and timestamps. Declares a timestamp offset of 0, so timestamp
/// bounds flow through even on rounds where some inputs are empty.
///
/// Wire it with the same number of inputs and outputs; port types are
/// unconstrained.
#[derive(Default)]
pub struct PassThrough;

#[async_trait]
impl Calculator for PassThrough {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        if contract.num_inputs() != contract.num_outputs() {
            return Err(GraphError::Validation(format!(
                "PassThrough needs matching port counts, got {} inputs and {} outputs",
                contract.num_inputs(),
                contract.num_outputs()
            )));
        }
        contract.set_all_input_types(PacketType::Any);
        contract.set_all_output_types(PacketType::Any);
        contract.set_timestamp_offset(0);
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let (inputs, outputs) = ctx.io();
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            let packet = input.value();
            if !packet.is_empty() {
                output.add_packet(packet.clone());
            }
        }
        Ok(())
    }
}
