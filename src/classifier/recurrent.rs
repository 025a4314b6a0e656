//! # Recurrent Layers
//!
//! Stacked, optionally bidirectional LSTM and GRU layers. Each direction of each
//! layer is a `candle_nn::rnn` cell; this module stacks the layers, runs the
//! backward direction over the reversed sequence and concatenates directions.
//! Weight names and gate orders follow PyTorch's `nn.LSTM` / `nn.GRU`, so
//! checkpoints exported from the training code load unchanged:
//!
//! - `weight_ih_l{k}[_reverse]`: `(gates * hidden, input)`
//! - `weight_hh_l{k}[_reverse]`: `(gates * hidden, hidden)`
//! - `bias_ih_l{k}[_reverse]`, `bias_hh_l{k}[_reverse]`: `(gates * hidden)`
//!
//! ## Hidden state layout:
//! `(num_layers * num_directions, batch, hidden_size)`, indexed
//! `layer * num_directions + direction`, with a cell tensor of the same shape for LSTM.
//!
//! Dropout between layers is a training-time feature and is not applied here.

use crate::classifier::model::CellType;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN};
use candle_nn::VarBuilder;
use std::collections::HashMap;

/// Carried-forward memory of a recurrent stack.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    pub h: Tensor,
    /// Cell state, present for LSTM only
    pub c: Option<Tensor>,
}

impl RecurrentState {
    pub fn shape(&self) -> Vec<usize> {
        self.h.dims().to_vec()
    }

    /// True when every element of the hidden (and cell) state is zero.
    pub fn is_zero(&self) -> Result<bool> {
        let h_zero = self.h.abs()?.sum_all()?.to_scalar::<f32>()? == 0.0;
        let c_zero = match &self.c {
            Some(c) => c.abs()?.sum_all()?.to_scalar::<f32>()? == 0.0,
            None => true,
        };
        Ok(h_zero && c_zero)
    }
}

/// One direction of one layer.
enum DirectionCell {
    Lstm(LSTM),
    Gru(GRU),
}

impl DirectionCell {
    fn load(
        vb: &VarBuilder,
        cell: CellType,
        input_size: usize,
        hidden_size: usize,
        layer: usize,
        reverse: bool,
    ) -> Result<Self> {
        let suffix = if reverse { "_reverse" } else { "" };
        let gates = cell.gate_count() * hidden_size;

        // `candle_nn::rnn::gru` only reads the `_l0` names, so every cell is
        // built from its own four tensors under those names.
        let tensors = HashMap::from([
            (
                "weight_ih_l0".to_string(),
                vb.get((gates, input_size), &format!("weight_ih_l{layer}{suffix}"))?,
            ),
            (
                "weight_hh_l0".to_string(),
                vb.get((gates, hidden_size), &format!("weight_hh_l{layer}{suffix}"))?,
            ),
            ("bias_ih_l0".to_string(), vb.get(gates, &format!("bias_ih_l{layer}{suffix}"))?),
            ("bias_hh_l0".to_string(), vb.get(gates, &format!("bias_hh_l{layer}{suffix}"))?),
        ]);
        let cell_vb = VarBuilder::from_tensors(tensors, DType::F32, vb.device());

        match cell {
            CellType::Lstm => Ok(Self::Lstm(lstm(input_size, hidden_size, LSTMConfig::default(), cell_vb)?)),
            CellType::Gru => Ok(Self::Gru(gru(input_size, hidden_size, GRUConfig::default(), cell_vb)?)),
        }
    }

    /// Step through `input (1, seq_len, in)` from `(h0, c0)`.
    ///
    /// Returns the per-step outputs `(1, seq_len, hidden)` and the final state.
    fn run(&self, input: &Tensor, h0: Tensor, c0: Option<Tensor>) -> Result<(Tensor, Tensor, Option<Tensor>)> {
        match self {
            Self::Lstm(cell) => {
                let c0 = c0.ok_or_else(|| candle_core::Error::Msg("LSTM step without cell state".to_string()))?;
                let states = cell.seq_init(input, &LSTMState { h: h0, c: c0 })?;
                let last = states
                    .last()
                    .ok_or_else(|| candle_core::Error::Msg("empty input sequence".to_string()))?;
                let (h, c) = (last.h.clone(), last.c.clone());
                Ok((cell.states_to_tensor(&states)?, h, Some(c)))
            }
            Self::Gru(cell) => {
                let states = cell.seq_init(input, &GRUState { h: h0 })?;
                let last = states
                    .last()
                    .ok_or_else(|| candle_core::Error::Msg("empty input sequence".to_string()))?;
                let h = last.h.clone();
                Ok((cell.states_to_tensor(&states)?, h, None))
            }
        }
    }
}

/// A stack of recurrent layers sharing one forward contract for every cell type:
/// `(input sequence, state) -> (output sequence, new state)`.
pub struct RecurrentStack {
    cell: CellType,
    /// `layers[layer][direction]`
    layers: Vec<Vec<DirectionCell>>,
    input_size: usize,
    hidden_size: usize,
    num_directions: usize,
}

impl RecurrentStack {
    pub fn load(
        vb: VarBuilder,
        cell: CellType,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
    ) -> Result<Self> {
        let num_directions = if bidirectional { 2 } else { 1 };

        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let layer_input = if layer == 0 { input_size } else { hidden_size * num_directions };
            let mut directions = Vec::with_capacity(num_directions);
            for direction in 0..num_directions {
                directions.push(DirectionCell::load(
                    &vb,
                    cell,
                    layer_input,
                    hidden_size,
                    layer,
                    direction == 1,
                )?);
            }
            layers.push(directions);
        }

        Ok(Self {
            cell,
            layers,
            input_size,
            hidden_size,
            num_directions,
        })
    }

    pub fn cell(&self) -> CellType {
        self.cell
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Width of each output step: `hidden_size * num_directions`.
    pub fn output_size(&self) -> usize {
        self.hidden_size * self.num_directions
    }

    /// `(num_layers * num_directions, batch, hidden_size)`
    pub fn state_shape(&self, batch: usize) -> (usize, usize, usize) {
        (self.layers.len() * self.num_directions, batch, self.hidden_size)
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<RecurrentState> {
        let shape = self.state_shape(batch);
        let h = Tensor::zeros(shape, DType::F32, device)?;
        let c = match self.cell {
            CellType::Lstm => Some(Tensor::zeros(shape, DType::F32, device)?),
            CellType::Gru => None,
        };
        Ok(RecurrentState { h, c })
    }

    /// Run the whole stack over `input` of shape `(1, seq_len, input_size)`.
    ///
    /// Returns the last layer's output sequence `(1, seq_len, hidden * directions)`
    /// and the final state of every layer and direction.
    pub fn forward(&self, input: &Tensor, state: &RecurrentState) -> Result<(Tensor, RecurrentState)> {
        let seq_len = input.dim(1)?;
        let reversed: Vec<u32> = (0..seq_len as u32).rev().collect();
        let reversed = Tensor::new(reversed.as_slice(), input.device())?;

        let mut layer_input = input.clone();
        let mut final_h = Vec::with_capacity(self.layers.len() * self.num_directions);
        let mut final_c = Vec::with_capacity(self.layers.len() * self.num_directions);

        for (layer, directions) in self.layers.iter().enumerate() {
            let mut outputs = Vec::with_capacity(self.num_directions);

            for (direction, cell) in directions.iter().enumerate() {
                let index = layer * self.num_directions + direction;
                let h0 = state.h.narrow(0, index, 1)?.squeeze(0)?;
                let c0 = match &state.c {
                    Some(c) => Some(c.narrow(0, index, 1)?.squeeze(0)?),
                    None => None,
                };

                let (sequence, h, c) = if direction == 1 {
                    let (sequence, h, c) = cell.run(&layer_input.index_select(&reversed, 1)?, h0, c0)?;
                    (sequence.index_select(&reversed, 1)?, h, c)
                } else {
                    cell.run(&layer_input, h0, c0)?
                };
                outputs.push(sequence);
                final_h.push(h);
                if let Some(c) = c {
                    final_c.push(c);
                }
            }

            layer_input = if outputs.len() == 1 {
                outputs.remove(0)
            } else {
                Tensor::cat(&outputs, 2)?
            };
        }

        let h = Tensor::stack(&final_h, 0)?;
        let c = if final_c.is_empty() {
            None
        } else {
            Some(Tensor::stack(&final_c, 0)?)
        };

        Ok((layer_input, RecurrentState { h, c }))
    }
}
