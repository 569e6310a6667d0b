//! Python bindings, built with the `python` feature.
//!
//! PyO3 cannot expose trait methods directly, so [`PyExperiment`] wraps an [`Experiment`]
//! together with the beam controller of its configuration and forwards to the
//! [`BaseExperiment`] methods. Timeline errors surface as `ValueError`.

use std::path::Path;

use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::beams::BeamController;
use crate::channel::{BaseChannel, DeviceKind};
use crate::config::SystemConfig;
use crate::device::BaseDevice;
use crate::error::TimelineError;
use crate::event::ChannelState;
use crate::experiment::{BaseExperiment, Experiment};
use crate::sequence::CompiledSequence;
use crate::units::Mu;
use crate::utils::sort_channel_names;

fn to_py_err(e: TimelineError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

#[pyclass(name = "Experiment")]
pub struct PyExperiment {
    exp: Experiment,
    beams: BeamController,
    compiled: Option<CompiledSequence>,
}

#[pymethods]
impl PyExperiment {
    #[new]
    #[pyo3(signature = (config_path=None))]
    fn new(config_path: Option<&str>) -> PyResult<Self> {
        let cfg = SystemConfig::load(config_path.map(Path::new)).map_err(to_py_err)?;
        let exp = Experiment::from_config(&cfg).map_err(to_py_err)?;
        let beams = BeamController::new(cfg.beams.clone()).map_err(to_py_err)?;
        Ok(Self {
            exp,
            beams,
            compiled: None,
        })
    }

    fn add_device(&mut self, name: &str, kind: &str, attenuator_latency_mu: Mu) -> PyResult<()> {
        let kind: DeviceKind = kind.parse().map_err(to_py_err)?;
        self.exp
            .add_device(name, kind, attenuator_latency_mu)
            .map_err(to_py_err)
    }

    fn add_channel(&mut self, dev_name: &str, chan_name: &str, latency_mu: Mu) -> PyResult<()> {
        self.exp
            .add_channel(dev_name, chan_name, latency_mu, ChannelState::default())
            .map_err(to_py_err)
    }

    fn now_mu(&self) -> Mu {
        self.exp.now_mu()
    }

    fn at_mu(&mut self, t: Mu) {
        self.exp.at_mu(t);
    }

    fn delay_mu(&mut self, dt: Mu) {
        self.exp.delay_mu(dt);
    }

    fn delay(&mut self, seconds: f64) {
        self.exp.delay(seconds);
    }

    fn ttl_on(&mut self, dev_name: &str, chan_name: &str) -> PyResult<()> {
        self.exp.ttl_on(dev_name, chan_name).map_err(to_py_err)
    }

    fn ttl_off(&mut self, dev_name: &str, chan_name: &str) -> PyResult<()> {
        self.exp.ttl_off(dev_name, chan_name).map_err(to_py_err)
    }

    fn pulse(&mut self, dev_name: &str, chan_name: &str, duration_mu: Mu) -> PyResult<()> {
        self.exp
            .pulse(dev_name, chan_name, duration_mu)
            .map_err(to_py_err)
    }

    fn dds_switch(&mut self, dev_name: &str, chan_name: &str, on: bool) -> PyResult<()> {
        self.exp.dds_switch(dev_name, chan_name, on).map_err(to_py_err)
    }

    fn set_frequency(&mut self, dev_name: &str, chan_name: &str, frequency_hz: f64) -> PyResult<()> {
        self.exp
            .set_frequency(dev_name, chan_name, frequency_hz)
            .map_err(to_py_err)
    }

    fn set_amplitude(&mut self, dev_name: &str, chan_name: &str, amplitude: f64) -> PyResult<()> {
        self.exp
            .set_amplitude(dev_name, chan_name, amplitude)
            .map_err(to_py_err)
    }

    fn set_attenuation(&mut self, dev_name: &str, chan_name: &str, attenuation_db: f64) -> PyResult<()> {
        self.exp
            .set_attenuation(dev_name, chan_name, attenuation_db)
            .map_err(to_py_err)
    }

    fn set_dac(&mut self, dev_name: &str, chan_name: &str, voltage: f64) -> PyResult<()> {
        self.exp.set_dac(dev_name, chan_name, voltage).map_err(to_py_err)
    }

    fn turn_on(&mut self, names: Vec<String>) -> PyResult<()> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.beams.turn_on(&mut self.exp, &names).map_err(to_py_err)
    }

    fn turn_off(&mut self, names: Vec<String>) -> PyResult<()> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.beams.turn_off(&mut self.exp, &names).map_err(to_py_err)
    }

    fn set_beams_to_defaults(&mut self) -> PyResult<()> {
        self.beams.set_to_defaults(&mut self.exp).map_err(to_py_err)
    }

    /// Compiles and returns the sequence duration in machine units.
    #[pyo3(signature = (stop_time=None))]
    fn compile(&mut self, stop_time: Option<Mu>) -> PyResult<Mu> {
        let seq = self.exp.compile(stop_time).map_err(to_py_err)?;
        let duration = seq.duration_mu;
        self.compiled = Some(seq);
        Ok(duration)
    }

    fn compiled_timestamps<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray1<Mu>> {
        match &self.compiled {
            Some(seq) => Ok(seq.timestamps().into_pyarray(py)),
            None => Err(PyValueError::new_err("experiment has not been compiled")),
        }
    }

    fn lane_report(&self) -> PyResult<(usize, usize, Vec<usize>)> {
        match &self.compiled {
            Some(seq) => {
                let report = &seq.lane_report;
                Ok((report.lanes_used, report.lane_switches, report.events_per_lane.clone()))
            }
            None => Err(PyValueError::new_err("experiment has not been compiled")),
        }
    }

    fn device_compiled_channel_names(&self, name: &str) -> PyResult<Vec<String>> {
        let dev = self.exp.dev(name).map_err(to_py_err)?;
        let mut names: Vec<String> = dev
            .compiled_channels()
            .iter()
            .map(|chan| chan.name().to_string())
            .collect();
        sort_channel_names(&mut names);
        Ok(names)
    }

    fn calc_signal<'py>(
        &self,
        py: Python<'py>,
        name: &str,
        start: Mu,
        end: Mu,
        nsamps: usize,
    ) -> PyResult<&'py PyArray2<f64>> {
        let arr = self
            .exp
            .device_calc_signal_nsamps(name, start, end, nsamps)
            .map_err(to_py_err)?;
        Ok(arr.into_pyarray(py))
    }

    fn is_edited(&self) -> bool {
        self.exp.is_edited()
    }

    fn is_compiled(&self) -> bool {
        self.exp.is_compiled()
    }

    fn is_fresh_compiled(&self) -> bool {
        self.exp.is_fresh_compiled()
    }

    fn clear_edit_cache(&mut self) {
        self.exp.clear_edit_cache();
        self.compiled = None;
    }

    fn clear_compile_cache(&mut self) {
        self.exp.clear_compile_cache();
        self.compiled = None;
    }
}

#[pymodule]
fn rtiocompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyExperiment>()?;
    Ok(())
}
