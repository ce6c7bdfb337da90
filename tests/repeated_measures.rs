use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tempfile::tempdir;

use hemitraj::fdr::CorrectedRow;
use hemitraj::io::read_aggregated;
use hemitraj::mixed::{
    FeatureTable, FitError, MixedModelSolver, ModalityPlan, ModelSpecification, RemlSolver,
    SolverFit,
};
use hemitraj::pipeline::{
    PipelineError, identify_significant_interactions, run_repeated_measures,
    run_repeated_measures_with,
};
use hemitraj::{AnalysisPlan, ExperimentConfig};

const WAVE: &str = "2_year_follow_up_y_arm_1";
const MODALITY: &str = "bilateral_cortical_volume";

fn volume_plan() -> AnalysisPlan {
    let mut plan = AnalysisPlan::default();
    plan.modalities = vec![ModalityPlan::new(MODALITY, "smri_vol_scs_intracranialv")];
    plan.batch.threads = Some(2);
    plan
}

fn write_inputs(config: &ExperimentConfig, features: &[&str], seed: u64) {
    write_inputs_with_predictor(config, "class_label", features, seed);
}

/// Writes a rescaled feature table of 48 subjects (sibling pairs within three sites,
/// both hemispheres each) and a catalog naming `features`. The class column is
/// named `predictor`.
fn write_inputs_with_predictor(
    config: &ExperimentConfig,
    predictor: &str,
    features: &[&str],
    seed: u64,
) {
    fs::create_dir_all(config.processed_data_dir()).unwrap();
    fs::write(
        config.catalog_path(),
        format!(
            "{{\"{MODALITY}\": [{}]}}",
            features
                .iter()
                .map(|f| format!("\"{f}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(seed);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let subject_sd = Normal::new(0.0, 0.6).unwrap();
    let noise = Normal::new(0.0, 0.3).unwrap();

    let mut file = File::create(config.features_path()).unwrap();
    let mut header = vec![
        "src_subject_id",
        "hemisphere",
        predictor,
        "interview_age",
        "age2",
        "demo_sex_v2",
        "img_device_label",
        "demo_comb_income_v2",
        "BMI_zscore",
        "site_id_l",
        "rel_family_id",
        "smri_vol_scs_intracranialv",
    ];
    header.extend_from_slice(features);
    writeln!(file, "{}", header.join(",")).unwrap();

    for subject in 0..48usize {
        let family = subject / 2;
        let site = family % 3;
        let class = subject % 4;
        let age: f64 = standard.sample(&mut rng);
        let bmi: f64 = standard.sample(&mut rng);
        let icv: f64 = standard.sample(&mut rng);
        let sex = rng.gen_range(1..=2);
        let device = format!("dev{}", subject % 3);
        let income = rng.gen_range(1..=5);
        let subject_offset: Vec<f64> = features.iter().map(|_| subject_sd.sample(&mut rng)).collect();

        for (hemi_code, hemi) in ["Left", "Right"].iter().enumerate() {
            let mut row = vec![
                format!("NDAR{subject:04}"),
                hemi.to_string(),
                class.to_string(),
                format!("{age}"),
                format!("{}", age * age),
                sex.to_string(),
                device.clone(),
                income.to_string(),
                format!("{bmi}"),
                format!("site{site:02}"),
                family.to_string(),
                format!("{icv}"),
            ];
            for offset in &subject_offset {
                let class_shift = [0.0, 0.4, -0.2, 0.1][class];
                let asymmetry = if hemi_code == 1 && class == 1 { 0.8 } else { 0.0 };
                let value = 0.3 * hemi_code as f64
                    + class_shift
                    + asymmetry
                    + 0.2 * age
                    + 0.5 * icv
                    + offset
                    + noise.sample(&mut rng);
                row.push(format!("{value}"));
            }
            writeln!(file, "{}", row.join(",")).unwrap();
        }
    }
}

fn read_corrected(path: &Path) -> Vec<CorrectedRow> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .deserialize::<CorrectedRow>()
        .map(|r| r.unwrap())
        .collect()
}

#[test]
fn single_feature_end_to_end() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 1, WAVE);
    write_inputs(&config, &["roiA"], 7);
    let plan = volume_plan();

    let fitted = run_repeated_measures(&config, &plan, "class_label").unwrap();
    assert_eq!(fitted.batch.failed, 0);
    assert_eq!(fitted.rows_written, 6);

    let aggregated = read_aggregated(&config.coefficients_path()).unwrap();
    let names: Vec<&str> = aggregated
        .rows()
        .iter()
        .map(|r| r.effect_name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "class_label1",
            "class_label2",
            "class_label3",
            "hemisphereRight:class_label1",
            "hemisphereRight:class_label2",
            "hemisphereRight:class_label3",
        ]
    );
    for row in aggregated.rows() {
        assert_eq!(row.modality, MODALITY);
        assert_eq!(row.feature, "roiA");
        assert!((0.0..=1.0).contains(&row.p_value));
        assert!(row.ci_lower <= row.estimate && row.estimate <= row.ci_upper);
    }

    let identified = identify_significant_interactions(&config, &plan).unwrap();
    assert_eq!(identified.rows_corrected, 3);

    // With one feature every stratum holds one p-value, so q equals p.
    let corrected = read_corrected(&config.corrected_path());
    assert_eq!(corrected.len(), 3);
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(config.report_path()).unwrap()).unwrap();
    for row in &corrected {
        let source = aggregated
            .rows()
            .iter()
            .find(|r| r.effect_name == row.effect_name)
            .unwrap();
        assert_abs_diff_eq!(row.q_value, source.p_value, epsilon = 1e-12);
        assert_eq!(row.significant, row.p_value <= 0.05);
        let listed = report
            .get(MODALITY)
            .and_then(|terms| terms.get(&row.effect_name))
            .is_some();
        assert_eq!(listed, row.significant);
    }

    // The simulated right-hemisphere shift for class 1 is large against the noise.
    let strong = corrected
        .iter()
        .find(|r| r.effect_name == "hemisphereRight:class_label1")
        .unwrap();
    assert!(strong.significant);
}

#[test]
fn identify_corrects_the_predictor_the_table_was_fitted_with() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 5, WAVE);
    write_inputs_with_predictor(&config, "traj", &["roiA"], 7);
    let plan = volume_plan();

    run_repeated_measures(&config, &plan, "traj").unwrap();
    let identified = identify_significant_interactions(&config, &plan).unwrap();
    assert_eq!(identified.rows_corrected, 3);

    let corrected = read_corrected(&config.corrected_path());
    let terms: Vec<&str> = corrected.iter().map(|r| r.effect_name.as_str()).collect();
    assert_eq!(
        terms,
        vec![
            "hemisphereRight:traj1",
            "hemisphereRight:traj2",
            "hemisphereRight:traj3",
        ]
    );
    assert!(corrected[0].significant);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(config.report_path()).unwrap()).unwrap();
    assert_eq!(report[MODALITY]["hemisphereRight:traj1"], serde_json::json!(["roiA"]));
}

#[test]
fn identify_stage_is_idempotent() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 3, WAVE);
    write_inputs(&config, &["roiA", "roiB", "roiC"], 11);
    let plan = volume_plan();

    run_repeated_measures(&config, &plan, "class_label").unwrap();
    identify_significant_interactions(&config, &plan).unwrap();
    let first = fs::read(config.report_path()).unwrap();
    identify_significant_interactions(&config, &plan).unwrap();
    let second = fs::read(config.report_path()).unwrap();
    assert_eq!(first, second);
}

/// Delegates to the REML solver except for one feature, which always fails.
struct FailingFor {
    feature: &'static str,
    inner: RemlSolver,
}

impl MixedModelSolver for FailingFor {
    fn fit(
        &self,
        spec: &ModelSpecification,
        table: &FeatureTable,
        deadline: Option<Instant>,
    ) -> Result<SolverFit, FitError> {
        if spec.response == self.feature {
            return Err(FitError::Solver("Hessian is singular".to_string()));
        }
        self.inner.fit(spec, table, deadline)
    }
}

#[test]
fn failing_model_is_skipped_and_the_batch_completes() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 2, WAVE);
    write_inputs(&config, &["roiA", "roiB", "roiC"], 5);
    let plan = volume_plan();
    let solver = FailingFor {
        feature: "roiB",
        inner: RemlSolver::default(),
    };

    let summary = run_repeated_measures_with(&solver, &config, &plan, "class_label").unwrap();
    assert_eq!(summary.batch.failed, 1);
    assert_eq!(summary.rows_written, 12);

    let aggregated = read_aggregated(&config.coefficients_path()).unwrap();
    assert!(aggregated.rows().iter().all(|r| r.feature != "roiB"));
    let features: Vec<&str> = aggregated
        .rows()
        .iter()
        .map(|r| r.feature.as_str())
        .collect();
    assert_eq!(&features[..6], &["roiA"; 6]);
    assert_eq!(&features[6..], &["roiC"; 6]);
}

#[test]
fn feature_missing_from_table_aborts_the_run() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 1, WAVE);
    write_inputs(&config, &["roiA"], 3);
    fs::write(
        config.catalog_path(),
        format!("{{\"{MODALITY}\": [\"roiA\", \"roiMissing\"]}}"),
    )
    .unwrap();

    let err = run_repeated_measures(&config, &volume_plan(), "class_label").unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
    assert!(!config.coefficients_path().exists());
}

#[test]
fn identify_without_fit_stage_fails() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 9, WAVE);
    let err = identify_significant_interactions(&config, &volume_plan()).unwrap_err();
    assert!(matches!(err, PipelineError::Output(_)));
}

#[test]
fn malformed_p_value_fails_only_its_stratum() {
    let root = tempdir().unwrap();
    let config = ExperimentConfig::new(root.path(), "test", 4, WAVE);
    fs::create_dir_all(config.results_dir()).unwrap();
    fs::write(
        config.coefficients_path(),
        "effect_name,estimate,ci_lower,ci_upper,std_error,df,t_stat,p_value,converged,modality,feature\n\
         hemisphereRight:class_label1,0.5,0.1,0.9,0.2,80,2.5,1.7,true,bilateral_cortical_volume,roiA\n\
         hemisphereRight:class_label2,0.9,0.5,1.3,0.2,80,4.5,0.0001,true,bilateral_cortical_volume,roiA\n",
    )
    .unwrap();

    let err = identify_significant_interactions(&config, &volume_plan()).unwrap_err();
    match err {
        PipelineError::StrataFailed(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].term, "hemisphereRight:class_label1");
        }
        other => panic!("unexpected error: {other}"),
    }

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(config.report_path()).unwrap()).unwrap();
    assert!(report[MODALITY].get("hemisphereRight:class_label1").is_none());
    assert_eq!(
        report[MODALITY]["hemisphereRight:class_label2"],
        serde_json::json!(["roiA"])
    );
}
