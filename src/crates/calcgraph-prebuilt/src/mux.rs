//! Arrival-order stream merging.

use async_trait::async_trait;
use calcgraph_core::{
    Calculator, CalculatorContext, CalculatorContract, GraphError, InputPolicy, PacketType,
    Result, Timestamp,
};

/// Merges any number of input streams onto one output in arrival order,
/// using the immediate policy: whichever input has data is forwarded without
/// waiting for the others.
///
/// Input streams are individually ordered but mutually unordered, so merged
/// packets are restamped with the smallest timestamp the output stream still
/// allows at or after their own. Payloads are untouched.
#[derive(Default)]
pub struct ImmediateMux;

#[async_trait]
impl Calculator for ImmediateMux {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        if contract.num_inputs() == 0 || contract.num_outputs() != 1 {
            return Err(GraphError::Validation(
                "ImmediateMux needs at least one input and exactly one output".into(),
            ));
        }
        contract.set_all_input_types(PacketType::Any);
        contract.set_output_type(0, PacketType::Any)?;
        contract.set_input_policy(InputPolicy::Immediate);
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let (inputs, outputs) = ctx.io();
        let output = &mut outputs[0];
        for input in inputs {
            let packet = input.value();
            if packet.is_empty() {
                continue;
            }
            let mut at = packet.timestamp().max(output.next_timestamp_bound());
            if !at.is_range_value() {
                // Keeps merged sentinels inside the regular range; a mux has
                // no sole-packet position to preserve.
                at = if at < Timestamp::MIN {
                    Timestamp::MIN
                } else {
                    Timestamp::MAX
                };
            }
            output.add_packet(packet.at(at));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcgraph_core::{
        CalculatorGraph, CalculatorRegistry, GraphConfig, NodeConfig, Packet,
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn merges_two_streams() {
        let mut registry = CalculatorRegistry::new();
        registry.register::<ImmediateMux>("ImmediateMux");

        let config = GraphConfig::new()
            .input_stream("left")
            .input_stream("right")
            .node(
                NodeConfig::new("ImmediateMux")
                    .input("left")
                    .input("right")
                    .output("merged"),
            )
            .with_num_workers(1);

        let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        graph
            .observe_output_stream("merged", move |packet| {
                sink.lock().push(*packet.get::<i64>());
                Ok(())
            })
            .expect("stream exists");

        graph.start_run(HashMap::new()).await.expect("start");
        graph
            .add_packet_to_input_stream("left", Packet::new(1i64).at(Timestamp::new(0)))
            .await
            .expect("add");
        graph
            .add_packet_to_input_stream("right", Packet::new(2i64).at(Timestamp::new(0)))
            .await
            .expect("add");
        graph
            .add_packet_to_input_stream("left", Packet::new(3i64).at(Timestamp::new(5)))
            .await
            .expect("add");
        graph.close_all_input_streams().expect("close");
        graph.wait_until_done().await.expect("done");

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&1) && seen.contains(&2) && seen.contains(&3));
    }
}
