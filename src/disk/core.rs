//! Core interfaces for disk image operations.
//!
//! Every orchestrated operation is a pipeline of steps sharing one context.
//! See [`Step`] and [`Pipeline`].

use log::{debug, error};

use super::error::Result;

/// Step in the pipeline.
pub trait Step<Ctx> {
    /// Run step.
    fn run(&mut self, ctx: &mut Ctx) -> Result<()>;

    /// Short name of the step used in logs.
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }
}

/// Steps of the pipeline.
pub type Steps<'s, Ctx> = Vec<Box<dyn Step<Ctx> + 's>>;

/// Direct pipeline, running step in order of appearance.
///
/// The first failing step stops the pipeline.
pub struct Pipeline<'ctx, 's, Ctx> {
    ctx: &'ctx mut Ctx,
    steps: Steps<'s, Ctx>,
}

impl<'ctx, 's, Ctx> Pipeline<'ctx, 's, Ctx> {
    /// Create new pipeline with given context.
    pub fn from_ctx(ctx: &'ctx mut Ctx) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
        }
    }

    /// Add step to the end of pipeline.
    pub fn add_step(&mut self, step: Box<dyn Step<Ctx> + 's>) {
        self.steps.push(step);
    }

    /// Add steps to the end of pipeline.
    pub fn add_steps<I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = Box<dyn Step<Ctx> + 's>>,
    {
        for step in steps.into_iter() {
            self.add_step(step);
        }
    }

    /// Create new pipeline with given context and steps.
    pub fn from_steps<I>(ctx: &'ctx mut Ctx, steps: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Step<Ctx> + 's>>,
    {
        let mut pipeline = Self::from_ctx(ctx);
        pipeline.add_steps(steps);
        pipeline
    }

    /// Run pipeline.
    pub fn run(self) -> Result<()> {
        for mut step in self.steps {
            debug!("step: {}", step.name());
            if let Err(err) = step.run(self.ctx) {
                error!("step {} failed: {}", step.name(), err);
                return Err(err);
            }
        }
        Ok(())
    }
}
