//! End-to-end walk through pool registration, run recording and daily observations

use chrono::NaiveDate;
use futures_util::TryStreamExt;
use panel::{
    ConflictError, MetricCandidate, ModelRunCandidate, PoolCandidate, PoolId, ReferentialError,
    SampleWindowUpdate, ShapeParameters, ValidationError,
};
use persistence::{Database, PanelError};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn weth_usdc() -> PoolCandidate {
    PoolCandidate {
        chain: "ethereum".into(),
        dex: "uniswap".into(),
        pool_address: "0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640".into(),
        token_a_symbol: "WETH".into(),
        token_b_symbol: "USDC".into(),
        token_a_address: "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".into(),
        token_b_address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into(),
        pair_label: "WETH-USDC".into(),
        fee_tier_bps: 5,
        in_main_sample: true,
        sample_start: Some(date(2023, 1, 1)),
        sample_end: None,
    }
}

fn acd11(pool_id: PoolId) -> ModelRunCandidate {
    ModelRunCandidate {
        pool_id,
        p: 1,
        q: 1,
        innovation: "exponential".into(),
        shapes: ShapeParameters::default(),
        duration_unit: "seconds".into(),
        diurnal_adjusted: true,
        sample_size: 25_000,
        intercept: 0.02,
        duration_coefs: vec![0.07],
        psi_coefs: vec![0.91],
        stationarity_slack: 1e-4,
        psi_lags: vec![1.0],
        theta_hat: vec![0.02, 0.07, 0.91],
        log_likelihood: -30_112.4,
        optimizer_status: "converged".into(),
        iterations: Some(58),
        grad_norm: Some(3.1e-6),
        estimation_start: date(2023, 10, 1),
        estimation_end: date(2023, 12, 31),
    }
}

#[tokio::test]
async fn scenario_register_record_observe() {
    let db = Database::in_memory().await.unwrap();
    let pools = db.pools();
    let runs = db.runs();
    let metrics = db.metrics();

    // register → id 1, visible by business key
    let pool_id = pools.register(&weth_usdc()).await.unwrap();
    assert_eq!(pool_id, PoolId(1));
    assert_eq!(
        pools
            .lookup_by_business_key("ethereum", "WETH-USDC", 5)
            .await
            .unwrap(),
        Some(pool_id)
    );

    // registering the same pool again never succeeds
    let err = pools.register(&weth_usdc()).await.unwrap_err();
    assert!(matches!(err, PanelError::Conflict(_)));

    // ACD(1,1) with consistent vectors
    let run_id = runs.record(acd11(pool_id)).await.unwrap();
    assert_eq!(runs.latest_for_pool(pool_id).await.unwrap(), Some(run_id));

    // α of length 2 for q = 1
    let mut bad = acd11(pool_id);
    bad.duration_coefs = vec![0.05, 0.02];
    let err = runs.record(bad).await.unwrap_err();
    assert!(matches!(
        err,
        PanelError::Validation(ValidationError::VectorLengthMismatch {
            field: "duration_coefs",
            expected: 1,
            actual: 2
        })
    ));

    // negative spread is refused, then accepted once fixed
    let mut obs = MetricCandidate::new(pool_id, date(2024, 1, 1));
    obs.values.v3_spread_bps = Some(-1.0);
    obs.model_run_id = Some(run_id);
    let err = metrics.observe(&obs).await.unwrap_err();
    assert!(matches!(
        err,
        PanelError::Validation(ValidationError::NegativeField {
            field: "v3_spread_bps"
        })
    ));

    obs.values.v3_spread_bps = Some(5.0);
    metrics.observe(&obs).await.unwrap();

    let err = metrics.observe(&obs).await.unwrap_err();
    assert!(matches!(
        err,
        PanelError::Conflict(ConflictError::DuplicateObservation { .. })
    ));

    let panel: Vec<_> = metrics
        .panel_for_pool(pool_id, date(2024, 1, 1)..=date(2024, 1, 31))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(panel.len(), 1);
    assert_eq!(panel[0].values.v3_spread_bps, Some(5.0));
    assert_eq!(panel[0].model_run_id, Some(run_id));
}

#[tokio::test]
async fn retired_pool_still_accepts_dependents() {
    let db = Database::in_memory().await.unwrap();
    let pool_id = db.pools().register(&weth_usdc()).await.unwrap();

    db.pools()
        .retire(pool_id, &SampleWindowUpdate::retire_at(date(2024, 6, 30)))
        .await
        .unwrap();

    // retirement changes the window, not existence
    db.runs().record(acd11(pool_id)).await.unwrap();
    db.metrics()
        .observe(&MetricCandidate::new(pool_id, date(2024, 7, 1)))
        .await
        .unwrap();

    let pool = db.pools().get(pool_id).await.unwrap().unwrap();
    assert!(!pool.window.in_main_sample);
}

#[tokio::test]
async fn cross_pool_link_is_always_rejected() {
    let db = Database::in_memory().await.unwrap();
    let first = db.pools().register(&weth_usdc()).await.unwrap();

    let mut second = weth_usdc();
    second.pool_address = "0x8ad599c3A0ff1De082011EFDDc58f1908eb6e6D8".into();
    second.fee_tier_bps = 30;
    let second = db.pools().register(&second).await.unwrap();

    let run_id = db.runs().record(acd11(first)).await.unwrap();

    for day in 1..=3 {
        let mut obs = MetricCandidate::new(second, date(2024, 1, day));
        obs.model_run_id = Some(run_id);
        let err = db.metrics().observe(&obs).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::Referential(ReferentialError::CrossPoolRunLink { .. })
        ));
    }
}
