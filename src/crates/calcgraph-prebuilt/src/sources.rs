//! Simple source calculators.

use async_trait::async_trait;
use calcgraph_core::{
    Calculator, CalculatorContext, CalculatorContract, GraphError, PacketType, Result, Timestamp,
};

/// Emits `0..count` as `i64` packets at timestamps `0..count`, one per round,
/// then stops gracefully. `count` comes from the optional `COUNT` input side
/// packet (`u64`), defaulting to 5.
#[derive(Default)]
pub struct RangeSource {
    next: i64,
    count: i64,
}

impl RangeSource {
    const DEFAULT_COUNT: i64 = 5;
}

#[async_trait]
impl Calculator for RangeSource {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        if contract.num_inputs() != 0 || contract.num_outputs() != 1 {
            return Err(GraphError::Validation(
                "RangeSource is a source with exactly one output".into(),
            ));
        }
        contract.set_output_type(0, PacketType::of::<i64>())?;
        contract.optional_input_side_packet("COUNT", PacketType::of::<u64>());
        Ok(())
    }

    async fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let count = ctx.input_side_packet("COUNT");
        self.count = if count.is_empty() {
            Self::DEFAULT_COUNT
        } else {
            *count.get::<u64>() as i64
        };
        self.next = 0;
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        if self.next >= self.count {
            return Err(GraphError::Stop);
        }
        let value = self.next;
        ctx.output(0).add(value, Timestamp::new(value));
        ctx.counter("range_source_packets").increment();
        self.next += 1;
        Ok(())
    }
}

/// Publishes the `VALUE` input side packet as the sole packet of its output
/// stream, stamped [`Timestamp::POST_STREAM`], then stops. Useful for
/// injecting configuration-time values into the streaming axis.
#[derive(Default)]
pub struct ConstantSource {
    emitted: bool,
}

#[async_trait]
impl Calculator for ConstantSource {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        if contract.num_inputs() != 0 || contract.num_outputs() != 1 {
            return Err(GraphError::Validation(
                "ConstantSource is a source with exactly one output".into(),
            ));
        }
        contract.set_output_type(0, PacketType::Any)?;
        contract.require_input_side_packet("VALUE", PacketType::Any)?;
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        if self.emitted {
            return Err(GraphError::Stop);
        }
        let value = ctx.input_side_packet("VALUE");
        ctx.output(0).add_packet(value.at(Timestamp::POST_STREAM));
        self.emitted = true;
        Ok(())
    }
}
