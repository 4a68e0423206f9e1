use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, info};

use crate::binning::BinnedCoverageBuilder;
use crate::coverage::{NormalizedCoverageQuery, PreparedCoverage};
use crate::dataframe::{DataFrame, CONTROL_COLUMN};
use crate::errs::{SpanError, SpanResult};
use crate::fit_info::{FitInformation, Fragment, TrackPaths};
use crate::genome::GenomeQuery;
use crate::hmm::fit::FitOptions;
use crate::labels::LocationLabel;
use crate::model::{fit_multi_start, EnrichmentModel, ModelType};
use crate::peaks::{
    call_peaks, ChromosomeBins, Peak, PeakCallingParameters,
};
use crate::tuner::{tune, TuneResult, TuningGrid};
use crate::util::CancellableState;

/// Everything needed to describe one fit besides the genome and sources.
#[derive(Debug, Clone)]
pub struct SpanConfig {
    pub bin_size: u32,
    pub fragment: Fragment,
    pub unique: bool,
    pub paths: Vec<TrackPaths>,
    pub track_labels: Vec<String>,
    pub model_type: ModelType,
    /// Directory of descriptor/model caches keyed by the fit id.
    pub cache_dir: Option<PathBuf>,
    pub mapability: Option<PathBuf>,
}

struct FittedState {
    prepared: PreparedCoverage,
    model: EnrichmentModel,
    chromosome_bins: Vec<ChromosomeBins>,
}

/// Wires the data flow together: sources -> binned dataframes ->
/// normalization -> descriptor -> model fit (cached by id) -> posteriors
/// -> peaks / tuning. Preparation is idempotent and mutex-guarded.
pub struct SpanAnalysis<'a> {
    query: GenomeQuery,
    coverage: NormalizedCoverageQuery<'a>,
    config: SpanConfig,
    fit_info: FitInformation,
    state: Mutex<Option<FittedState>>,
}

impl<'a> SpanAnalysis<'a> {
    pub fn new(
        query: GenomeQuery,
        builder: BinnedCoverageBuilder<'a>,
        config: SpanConfig,
    ) -> Self {
        let fit_info = FitInformation::new(
            query.genome(),
            config.paths.clone(),
            config.track_labels.clone(),
            config.fragment,
            config.unique,
            config.bin_size,
            &config.model_type.fqn(),
            config.mapability.clone(),
        );
        let coverage =
            NormalizedCoverageQuery::new(builder, query.clone());
        Self {
            query,
            coverage,
            config,
            fit_info,
            state: Mutex::new(None),
        }
    }

    pub fn fit_information(&self) -> &FitInformation {
        &self.fit_info
    }

    pub fn genome_query(&self) -> &GenomeQuery {
        &self.query
    }

    /// Build dataframes, train (or load) the model, and decode posterior
    /// null probabilities per chromosome. Later calls are no-ops.
    pub fn prepare(&self, options: &FitOptions) -> SpanResult<()> {
        let mut guard = self.state.lock().expect("analysis state poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let prepared = self.coverage.prepare_data()?;
        let ordered_frames = prepared
            .query
            .chromosomes()
            .iter()
            .map(|c| &prepared.dataframes[&c.name])
            .collect::<Vec<&DataFrame>>();

        let model = self.obtain_model(&ordered_frames, options)?;
        let chromosome_bins = self.decode_posteriors(&prepared, &model)?;
        *guard = Some(FittedState { prepared, model, chromosome_bins });
        Ok(())
    }

    fn obtain_model(
        &self,
        data: &[&DataFrame],
        options: &FitOptions,
    ) -> SpanResult<EnrichmentModel> {
        if let Some(dir) = &self.config.cache_dir {
            self.fit_info.check_build(self.query.genome())?;
            if let Some(model) = self.fit_info.load_model(dir)? {
                info!(
                    "reusing cached model {} for fit {}",
                    self.fit_info.fqn,
                    self.fit_info.id()
                );
                return Ok(model);
            }
        }
        let (model, result) =
            fit_multi_start(&self.config.model_type, data, options)?;
        debug!(
            "trained {} in {} iterations",
            self.config.model_type.fqn(),
            result.iterations
        );
        if let Some(dir) = &self.config.cache_dir {
            self.fit_info.save(dir)?;
            self.fit_info.save_model(dir, &model)?;
        }
        Ok(model)
    }

    fn decode_posteriors(
        &self,
        prepared: &PreparedCoverage,
        model: &EnrichmentModel,
    ) -> SpanResult<Vec<ChromosomeBins>> {
        prepared
            .query
            .chromosomes()
            .iter()
            .map(|chromosome| {
                let df = &prepared.dataframes[&chromosome.name];
                let ln_null = model.ln_null_posteriors(df)?;
                let signal = df.treatment()?.to_vec();
                let scaled_control = match (
                    prepared.scales,
                    df.has_column(CONTROL_COLUMN),
                ) {
                    // the background the scorer sees is the mixed
                    // control, beta * scale_control * input
                    (Some(scales), true) => Some(
                        df.float_column(CONTROL_COLUMN)?
                            .iter()
                            .map(|&v| {
                                v * scales.scale_control * scales.beta
                            })
                            .collect(),
                    ),
                    _ => None,
                };
                Ok(ChromosomeBins {
                    chromosome: (*chromosome).clone(),
                    bin_size: self.config.bin_size,
                    ln_null,
                    signal,
                    scaled_control,
                })
            })
            .collect()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&FittedState) -> SpanResult<T>,
    ) -> SpanResult<T> {
        let guard = self.state.lock().expect("analysis state poisoned");
        match guard.as_ref() {
            Some(state) => f(state),
            None => Err(SpanError::invalid_input(
                "analysis is not prepared, call prepare() first"
                    .to_owned(),
            )),
        }
    }

    /// Peak calls over the whole analyzed genome.
    pub fn get_peaks(
        &self,
        params: &PeakCallingParameters,
        cancel: &CancellableState,
    ) -> SpanResult<Vec<Peak>> {
        self.with_state(|state| {
            call_peaks(&state.chromosome_bins, params, cancel)
        })
    }

    /// Semi-supervised parameter selection against the labels.
    pub fn tune(
        &self,
        labels: &[LocationLabel],
        grid: &TuningGrid,
        cancel: &CancellableState,
    ) -> SpanResult<TuneResult> {
        self.with_state(|state| {
            tune(&state.chromosome_bins, labels, grid, cancel)
        })
    }

    /// The trained model, once prepared.
    pub fn model(&self) -> SpanResult<EnrichmentModel> {
        self.with_state(|state| Ok(state.model.clone()))
    }
}
