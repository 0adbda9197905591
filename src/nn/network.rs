//! An ordered sequence of layers.

use super::layer::Layer;
use super::module::Module;
use crate::asg::Shape;
use crate::runtime::session::ParameterMap;
use crate::tensor::Tensor;
use rand::RngCore;

pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Threads `inputs` through every layer in order.
    pub fn apply(&self, inputs: &Tensor) -> Tensor {
        self.layers.iter().fold(inputs.clone(), |x, layer| layer.forward(&x))
    }

    /// Parameters of every layer, concatenated in layer order.
    pub fn variables(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }
}

impl Module for Network {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.apply(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.variables()
    }

    fn parameter_shapes(&self) -> Vec<(String, Shape)> {
        self.layers.iter().flat_map(|l| l.parameter_shapes()).collect()
    }

    fn init_parameters(&self, rng: &mut dyn RngCore) -> ParameterMap {
        let mut params = ParameterMap::new();
        for layer in &self.layers {
            params.extend(layer.init_parameters(rng));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::shape_inference::ShapeInference;
    use crate::nn::{Conv2d, Linear, Reshape, Resize};
    use crate::tensor::GraphContext;
    use std::collections::HashMap;

    #[test]
    fn output_shape_follows_layer_chain() {
        let ctx = GraphContext::shared();
        let net = Network::new(vec![
            Linear::new(&ctx, "net.0", 10, 196).into(),
            Reshape::new(&[14, 14, 1]).into(),
            Resize::new(28, 28).into(),
            Conv2d::new(&ctx, "net.3", 1, 8).into(),
        ]);
        let x = Tensor::new_input(&ctx, "x");
        let y = net.apply(&x);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(y.node_id);
        let mut shapes: HashMap<String, Shape> = net.parameter_shapes().into_iter().collect();
        shapes.insert("x".to_string(), vec![5, 10]);
        ShapeInference::run(&mut graph, &shapes).unwrap();

        assert_eq!(graph.shape_of(y.node_id).unwrap(), &vec![5, 28, 28, 8]);
        let names: Vec<String> = net.variables().iter().filter_map(|t| t.name()).collect();
        assert_eq!(names, vec!["net.0.weights", "net.0.bias", "net.3.weights", "net.3.bias"]);
    }
}
