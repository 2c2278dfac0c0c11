//! Interpretation workflow state machine.
//!
//! A subject (analysis or single allele) has a sequence of rounds.  At most
//! one round is not `Done` at any time, enforced by a partial unique index.
//! Rounds are picked up with `start`, mutated by their owner only, and left
//! with one of the `mark_*` actions (which open the next round) or with
//! `finalize` (which commits decisions and writes snapshots).

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, SqliteConnection, SqlitePool};

use crate::{
    assessment::{self, Author, Committed, Decisions},
    common::{all_allele_ids, GpAlleleIds, GpKey},
    conf::{Config, FinalizeRequirements},
    db::models::{Interpretation, InterpretationSnapshot, InterpretationStatus, WorkflowStatus},
    err::{Error, Result},
    filters::{
        chain::{self, ChainResult},
        query,
    },
};

pub mod snapshot;

/// What an interpretation round is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Subject {
    Analysis(i64),
    Allele(i64),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Analysis(id) => write!(f, "analysis {}", id),
            Subject::Allele(id) => write!(f, "allele {}", id),
        }
    }
}

impl Subject {
    pub fn id(&self) -> i64 {
        match self {
            Subject::Analysis(id) | Subject::Allele(id) => *id,
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Subject::Analysis(_) => "analysisinterpretation",
            Subject::Allele(_) => "alleleinterpretation",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Subject::Analysis(_) => "analysis_id",
            Subject::Allele(_) => "allele_id",
        }
    }

    fn snapshot_table(&self) -> &'static str {
        match self {
            Subject::Analysis(_) => "analysisinterpretationsnapshot",
            Subject::Allele(_) => "alleleinterpretationsnapshot",
        }
    }

    fn analysis_id(&self) -> Option<i64> {
        match self {
            Subject::Analysis(id) => Some(*id),
            Subject::Allele(_) => None,
        }
    }

    fn finalize_requirements<'a>(&self, conf: &'a Config) -> &'a FinalizeRequirements {
        match self {
            Subject::Analysis(_) => &conf.workflow.analysis.finalize_requirements,
            Subject::Allele(_) => &conf.workflow.allele.finalize_requirements,
        }
    }

    fn select(&self) -> String {
        format!(
            "SELECT id, {} AS subject_id, genepanel_name, genepanel_version, user_id, status, \
             workflow_status, finalized, state, user_state, filterconfig_id, date_created, \
             date_last_update FROM {}",
            self.column(),
            self.table()
        )
    }
}

/// Payload of `finalize`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalizeRequest {
    /// Filter config the interpreter worked with; no filtering if unset.
    #[serde(default)]
    pub filterconfig_id: Option<i64>,
    #[serde(default)]
    pub decisions: Decisions,
}

/// Outcome of `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub interpretation_id: i64,
    pub committed: Committed,
    pub num_snapshots: usize,
}

/// A finalized round along with its snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    pub interpretation: Interpretation,
    pub snapshots: Vec<InterpretationSnapshot>,
}

async fn latest(conn: &mut SqliteConnection, subject: Subject) -> Result<Interpretation> {
    let sql = format!(
        "{} WHERE {} = ? ORDER BY id DESC LIMIT 1",
        subject.select(),
        subject.column()
    );
    sqlx::query_as::<_, Interpretation>(&sql)
        .bind(subject.id())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| Error::not_found("interpretation", subject))
}

fn check_owner(round: &Interpretation, user_id: i64) -> Result<()> {
    if round.user_id == Some(user_id) {
        Ok(())
    } else {
        Err(Error::NotOwner {
            interpretation_id: round.id,
            owner: round.user_id,
            user_id,
        })
    }
}

fn check_ongoing(round: &Interpretation, subject: Subject, action: &str) -> Result<()> {
    if round.status == InterpretationStatus::Ongoing {
        Ok(())
    } else {
        Err(Error::InvalidTransition(format!(
            "cannot {} {} round {} with status {}",
            action, subject, round.id, round.status
        )))
    }
}

/// Insert a new `Not started` round.
async fn insert_round(
    conn: &mut SqliteConnection,
    subject: Subject,
    genepanel: &GpKey,
    workflow_status: WorkflowStatus,
    state: &Value,
) -> Result<i64> {
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO {} ({}, genepanel_name, genepanel_version, workflow_status, state, \
         date_created, date_last_update) VALUES (?, ?, ?, ?, ?, ?, ?)",
        subject.table(),
        subject.column()
    );
    let id = sqlx::query(&sql)
        .bind(subject.id())
        .bind(&genepanel.name)
        .bind(&genepanel.version)
        .bind(workflow_status)
        .bind(Json(state))
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Move the ongoing round `id` to `Done`, failing if it changed underneath.
async fn close_round(
    conn: &mut SqliteConnection,
    subject: Subject,
    id: i64,
    finalized: bool,
    filterconfig_id: Option<i64>,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = 'Done', finalized = ?, filterconfig_id = COALESCE(?, filterconfig_id), \
         date_last_update = ? WHERE id = ? AND status = 'Ongoing'",
        subject.table()
    );
    let result = sqlx::query(&sql)
        .bind(finalized)
        .bind(filterconfig_id)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;
    if result.rows_affected() != 1 {
        return Err(Error::ConcurrencyConflict(format!(
            "{} round {} is no longer ongoing",
            subject, id
        )));
    }
    Ok(())
}

/// Latest round of `subject`.
pub async fn current(pool: &SqlitePool, subject: Subject) -> Result<Interpretation> {
    let mut conn = pool.acquire().await?;
    latest(&mut conn, subject).await
}

/// Create the first round of `subject`.
///
/// Analyses use their own gene panel; alleles need `genepanel`.
pub async fn open(pool: &SqlitePool, subject: Subject, genepanel: Option<&GpKey>) -> Result<Interpretation> {
    let mut tx = pool.begin().await?;
    match latest(&mut tx, subject).await {
        Ok(round) => {
            return Err(Error::InvalidTransition(format!(
                "{} already has round {}",
                subject, round.id
            )))
        }
        Err(Error::NotFound { .. }) => (),
        Err(err) => return Err(err),
    }
    let genepanel = match (subject, genepanel) {
        (_, Some(genepanel)) => genepanel.clone(),
        (Subject::Analysis(analysis_id), None) => {
            let (name, version): (String, String) = sqlx::query_as(
                "SELECT genepanel_name, genepanel_version FROM analysis WHERE id = ?",
            )
            .bind(analysis_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("analysis", analysis_id))?;
            GpKey::new(name, version)
        }
        (Subject::Allele(_), None) => {
            return Err(Error::Validation(format!(
                "{} needs a gene panel to open a round",
                subject
            )))
        }
    };
    insert_round(
        &mut tx,
        subject,
        &genepanel,
        WorkflowStatus::Interpretation,
        &Value::Object(Default::default()),
    )
    .await?;
    let round = latest(&mut tx, subject).await?;
    tx.commit().await?;
    tracing::info!("opened round {} of {}", round.id, subject);
    Ok(round)
}

/// Pick up the waiting round; `user_id` becomes its owner.
pub async fn start(pool: &SqlitePool, subject: Subject, user_id: i64) -> Result<Interpretation> {
    let mut tx = pool.begin().await?;
    let round = latest(&mut tx, subject).await?;
    if round.status != InterpretationStatus::NotStarted {
        return Err(Error::InvalidTransition(format!(
            "cannot start {} round {} with status {}",
            subject, round.id, round.status
        )));
    }
    let sql = format!(
        "UPDATE {} SET status = 'Ongoing', user_id = ?, date_last_update = ? \
         WHERE id = ? AND status = 'Not started'",
        subject.table()
    );
    let result = sqlx::query(&sql)
        .bind(user_id)
        .bind(Utc::now())
        .bind(round.id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() != 1 {
        return Err(Error::ConcurrencyConflict(format!(
            "{} round {} was started concurrently",
            subject, round.id
        )));
    }
    let round = latest(&mut tx, subject).await?;
    tx.commit().await?;
    tracing::info!("user {} started round {} of {}", user_id, round.id, subject);
    Ok(round)
}

/// Replace `state` and/or `user_state` of the ongoing round.
pub async fn save(
    pool: &SqlitePool,
    subject: Subject,
    user_id: i64,
    state: Option<&Value>,
    user_state: Option<&Value>,
) -> Result<Interpretation> {
    let mut tx = pool.begin().await?;
    let round = latest(&mut tx, subject).await?;
    check_ongoing(&round, subject, "save")?;
    check_owner(&round, user_id)?;
    let state = state.unwrap_or(&round.state.0);
    let user_state = user_state.unwrap_or(&round.user_state.0);
    let sql = format!(
        "UPDATE {} SET state = ?, user_state = ?, date_last_update = ? WHERE id = ?",
        subject.table()
    );
    sqlx::query(&sql)
        .bind(Json(state))
        .bind(Json(user_state))
        .bind(Utc::now())
        .bind(round.id)
        .execute(&mut *tx)
        .await?;
    let round = latest(&mut tx, subject).await?;
    tx.commit().await?;
    tracing::debug!("user {} saved round {} of {}", user_id, round.id, subject);
    Ok(round)
}

/// Hand the ongoing round over to `new_user_id`.
pub async fn reassign(
    pool: &SqlitePool,
    subject: Subject,
    user_id: i64,
    new_user_id: i64,
) -> Result<Interpretation> {
    let mut tx = pool.begin().await?;
    let round = latest(&mut tx, subject).await?;
    check_ongoing(&round, subject, "reassign")?;
    check_owner(&round, user_id)?;
    let sql = format!(
        "UPDATE {} SET user_id = ?, date_last_update = ? WHERE id = ?",
        subject.table()
    );
    sqlx::query(&sql)
        .bind(new_user_id)
        .bind(Utc::now())
        .bind(round.id)
        .execute(&mut *tx)
        .await?;
    let round = latest(&mut tx, subject).await?;
    tx.commit().await?;
    tracing::info!(
        "round {} of {} reassigned from user {} to user {}",
        round.id,
        subject,
        user_id,
        new_user_id
    );
    Ok(round)
}

/// Complete the ongoing round and open the next one in `workflow_status`.
async fn mark(
    pool: &SqlitePool,
    subject: Subject,
    user_id: i64,
    workflow_status: WorkflowStatus,
) -> Result<Interpretation> {
    let mut tx = pool.begin().await?;
    let round = latest(&mut tx, subject).await?;
    check_ongoing(&round, subject, "mark")?;
    check_owner(&round, user_id)?;
    close_round(&mut tx, subject, round.id, false, None).await?;
    let genepanel = GpKey::new(&round.genepanel_name, &round.genepanel_version);
    insert_round(&mut tx, subject, &genepanel, workflow_status, &round.state.0).await?;
    let next = latest(&mut tx, subject).await?;
    tx.commit().await?;
    tracing::info!(
        "round {} of {} done, round {} waits for {}",
        round.id,
        subject,
        next.id,
        workflow_status
    );
    Ok(next)
}

pub async fn mark_review(pool: &SqlitePool, subject: Subject, user_id: i64) -> Result<Interpretation> {
    mark(pool, subject, user_id, WorkflowStatus::Review).await
}

pub async fn mark_medicalreview(pool: &SqlitePool, subject: Subject, user_id: i64) -> Result<Interpretation> {
    mark(pool, subject, user_id, WorkflowStatus::MedicalReview).await
}

pub async fn mark_notready(pool: &SqlitePool, subject: Subject, user_id: i64) -> Result<Interpretation> {
    mark(pool, subject, user_id, WorkflowStatus::NotReady).await
}

pub async fn mark_interpretation(pool: &SqlitePool, subject: Subject, user_id: i64) -> Result<Interpretation> {
    mark(pool, subject, user_id, WorkflowStatus::Interpretation).await
}

/// Alleles of the analysis carried by a proband, keyed by the analysis gene panel.
pub async fn analysis_allele_ids(conn: &mut SqliteConnection, analysis_id: i64) -> Result<GpAlleleIds> {
    let (name, version): (String, String) =
        sqlx::query_as("SELECT genepanel_name, genepanel_version FROM analysis WHERE id = ?")
            .bind(analysis_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::not_found("analysis", analysis_id))?;
    let allele_ids = query::proband_variant_allele_ids(conn, analysis_id).await?;
    Ok(GpAlleleIds::from([(GpKey::new(name, version), allele_ids)]))
}

/// Candidate alleles of a round.
async fn candidates(
    conn: &mut SqliteConnection,
    subject: Subject,
    round: &Interpretation,
) -> Result<GpAlleleIds> {
    match subject {
        Subject::Analysis(analysis_id) => analysis_allele_ids(conn, analysis_id).await,
        Subject::Allele(allele_id) => Ok(GpAlleleIds::from([(
            GpKey::new(&round.genepanel_name, &round.genepanel_version),
            BTreeSet::from([allele_id]),
        )])),
    }
}

/// Survivors and per-filter exclusions of the analysis under a filter config.
pub async fn filtered_alleles(
    pool: &SqlitePool,
    conf: &Config,
    analysis_id: i64,
    filterconfig_id: i64,
) -> Result<ChainResult> {
    let mut tx = pool.begin().await?;
    let gp_allele_ids = analysis_allele_ids(&mut tx, analysis_id).await?;
    let result =
        chain::run_filterconfig_in(&mut tx, conf, filterconfig_id, Some(analysis_id), &gp_allele_ids).await?;
    tx.rollback().await?;
    Ok(result)
}

/// The survivors must be exactly the alleles with an assessment decision.
fn check_decisions(
    survivors: &BTreeSet<i64>,
    candidates: &BTreeSet<i64>,
    decisions: &Decisions,
) -> Result<()> {
    let decided = decisions.alleleassessments.keys().copied().collect::<BTreeSet<_>>();
    if let Some(allele_id) = survivors.difference(&decided).next() {
        return Err(Error::Validation(format!(
            "allele {} survived filtering but has no assessment decision",
            allele_id
        )));
    }
    if let Some(allele_id) = decided.difference(survivors).next() {
        let reason = if candidates.contains(allele_id) {
            "was filtered"
        } else {
            "is not part of the round"
        };
        return Err(Error::Validation(format!(
            "allele {} has an assessment decision but {}",
            allele_id, reason
        )));
    }
    Ok(())
}

/// Finalize the ongoing round.
///
/// Runs the filter config, checks the decisions against the survivors,
/// commits them and snapshots every candidate allele, all in one
/// transaction.  A round that is already `Done` yields `ConcurrencyConflict`.
pub async fn finalize(
    pool: &SqlitePool,
    conf: &Config,
    subject: Subject,
    user_id: i64,
    request: &FinalizeRequest,
) -> Result<Finalized> {
    let before = std::time::Instant::now();
    let mut tx = pool.begin().await?;
    let round = latest(&mut tx, subject).await?;
    match round.status {
        InterpretationStatus::Ongoing => (),
        InterpretationStatus::Done => {
            return Err(Error::ConcurrencyConflict(format!(
                "{} round {} is already done",
                subject, round.id
            )))
        }
        InterpretationStatus::NotStarted => check_ongoing(&round, subject, "finalize")?,
    }
    check_owner(&round, user_id)?;
    let allowed = &subject.finalize_requirements(conf).workflow_status;
    if !allowed.contains(&round.workflow_status) {
        return Err(Error::InvalidTransition(format!(
            "cannot finalize {} round {} in workflow status {}",
            subject, round.id, round.workflow_status
        )));
    }

    let gp_allele_ids = candidates(&mut tx, subject, &round).await?;
    let result = match request.filterconfig_id {
        Some(filterconfig_id) => {
            chain::run_filterconfig_in(
                &mut tx,
                conf,
                filterconfig_id,
                subject.analysis_id(),
                &gp_allele_ids,
            )
            .await?
        }
        None => ChainResult {
            remaining: gp_allele_ids.clone(),
            ..Default::default()
        },
    };
    let candidate_ids = all_allele_ids(&gp_allele_ids);
    check_decisions(&result.remaining_allele_ids(), &candidate_ids, &request.decisions)?;

    let usergroup_id: i64 = sqlx::query_scalar("SELECT usergroup_id FROM user WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("user", user_id))?;
    let author = Author {
        user_id,
        usergroup_id: Some(usergroup_id),
        genepanel: GpKey::new(&round.genepanel_name, &round.genepanel_version),
        analysis_id: subject.analysis_id(),
    };
    let committed = assessment::commit_in(&mut tx, &author, &request.decisions).await?;
    let num_snapshots = snapshot::write(
        &mut tx,
        subject,
        round.id,
        &candidate_ids,
        &result.excluded_by,
        Utc::now(),
    )
    .await?;
    close_round(&mut tx, subject, round.id, true, request.filterconfig_id).await?;
    tx.commit().await?;

    tracing::info!(
        "user {} finalized round {} of {}: {} alleles, {} filtered, {} new records in {:?}",
        user_id,
        round.id,
        subject,
        num_snapshots,
        result.excluded_by.len(),
        committed.created,
        before.elapsed()
    );
    Ok(Finalized {
        interpretation_id: round.id,
        committed,
        num_snapshots,
    })
}

/// Open a new round after the latest one was completed, copying its state.
pub async fn reopen(pool: &SqlitePool, subject: Subject) -> Result<Interpretation> {
    let mut tx = pool.begin().await?;
    let round = latest(&mut tx, subject).await?;
    if round.status != InterpretationStatus::Done {
        return Err(Error::InvalidTransition(format!(
            "cannot reopen {} round {} with status {}",
            subject, round.id, round.status
        )));
    }
    let genepanel = GpKey::new(&round.genepanel_name, &round.genepanel_version);
    insert_round(&mut tx, subject, &genepanel, round.workflow_status, &round.state.0).await?;
    let next = latest(&mut tx, subject).await?;
    tx.commit().await?;
    tracing::info!("reopened {} with round {}", subject, next.id);
    Ok(next)
}

/// Finalized rounds of `subject` with their snapshots, oldest first.
pub async fn history(pool: &SqlitePool, subject: Subject) -> Result<Vec<Round>> {
    let mut conn = pool.acquire().await?;
    let sql = format!(
        "{} WHERE {} = ? AND finalized ORDER BY id",
        subject.select(),
        subject.column()
    );
    let interpretations = sqlx::query_as::<_, Interpretation>(&sql)
        .bind(subject.id())
        .fetch_all(&mut *conn)
        .await?;
    let mut rounds = Vec::with_capacity(interpretations.len());
    for interpretation in interpretations {
        let snapshots = snapshot::load(&mut conn, subject, interpretation.id).await?;
        rounds.push(Round {
            interpretation,
            snapshots,
        });
    }
    Ok(rounds)
}

/// Delete an analysis with its samples, genotypes, rounds and snapshots.
///
/// Alleles and assessments stay; assessments lose their analysis reference.
pub async fn delete_analysis(pool: &SqlitePool, analysis_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM analysis WHERE id = ?")
        .bind(analysis_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found("analysis", analysis_id));
    }
    tx.commit().await?;
    tracing::info!("deleted analysis {}", analysis_id);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;
    use sqlx::SqlitePool;

    use super::{FinalizeRequest, Subject};
    use crate::{
        assessment::{Decision, Decisions, NewAlleleAssessment},
        conf::Config,
        db::models::{CallerType, Classification, GenotypeType, InterpretationStatus, Sex, WorkflowStatus},
        err::Error,
        filterconfig::{self, NewFilterConfig},
        testing,
    };

    struct Fixture {
        pool: SqlitePool,
        conf: Config,
        alice: i64,
        bob: i64,
        analysis_id: i64,
        kept: i64,
        cnv: i64,
        filterconfig_id: i64,
    }

    /// Single-sample analysis with one SNV and one CNV, and a config
    /// filtering CNVs.
    async fn fixture() -> Result<Fixture, anyhow::Error> {
        fixture_on(testing::pool().await?).await
    }

    async fn fixture_on(pool: SqlitePool) -> Result<Fixture, anyhow::Error> {
        let conf = Config::default();
        let (usergroup_id, alice) = testing::user(&pool, "alice", "lab").await?;
        let (_, bob) = testing::user(&pool, "bob", "lab").await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let analysis_id = testing::analysis(&pool, "sample1", &gp_key).await?;
        let proband =
            testing::sample(&pool, analysis_id, "P", true, true, Sex::Female, Default::default()).await?;
        let kept = testing::allele(&pool, "13", 32_900_000, 1).await?;
        let cnv = testing::allele_with(&pool, "13", 32_950_000, 5_000, CallerType::Cnv).await?;
        for allele_id in [kept, cnv] {
            testing::genotype(&pool, proband, allele_id, GenotypeType::Heterozygous, Some(500.0), Some(0.5))
                .await?;
        }
        let new = NewFilterConfig::from_json(
            serde_json::json!({
                "name": "Default",
                "filterconfig": {"filters": [{"name": "callertype", "config": {"caller_types": ["CNV"]}}]}
            }),
            &conf,
        )?;
        let filterconfig_id = filterconfig::create(&pool, usergroup_id, &new, &conf).await?;
        super::open(&pool, Subject::Analysis(analysis_id), None).await?;
        Ok(Fixture {
            pool,
            conf,
            alice,
            bob,
            analysis_id,
            kept,
            cnv,
            filterconfig_id,
        })
    }

    fn request(fx: &Fixture, decision: Decision<NewAlleleAssessment>) -> FinalizeRequest {
        FinalizeRequest {
            filterconfig_id: Some(fx.filterconfig_id),
            decisions: Decisions {
                alleleassessments: [(fx.kept, decision)].into(),
                ..Default::default()
            },
        }
    }

    fn class(classification: Classification, presented_id: Option<i64>) -> Decision<NewAlleleAssessment> {
        Decision::New {
            presented_id,
            data: NewAlleleAssessment {
                classification,
                evaluation: serde_json::json!({"acmg": {"included": []}}),
                reference_ids: vec![],
            },
        }
    }

    #[tokio::test]
    async fn owner_and_transitions() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Analysis(fx.analysis_id);

        let res = super::save(&fx.pool, subject, fx.alice, Some(&serde_json::json!({})), None).await;
        assert!(matches!(res, Err(Error::InvalidTransition(_))), "{:?}", res);

        let round = super::start(&fx.pool, subject, fx.alice).await?;
        assert_eq!(round.status, InterpretationStatus::Ongoing);
        assert_eq!(round.user_id, Some(fx.alice));
        let res = super::start(&fx.pool, subject, fx.bob).await;
        assert!(matches!(res, Err(Error::InvalidTransition(_))), "{:?}", res);

        let res = super::save(&fx.pool, subject, fx.bob, Some(&serde_json::json!({"x": 1})), None).await;
        assert!(matches!(res, Err(Error::NotOwner { .. })), "{:?}", res);
        let state = serde_json::json!({"allele": {"1": {"verification": "verified"}}});
        let saved = super::save(&fx.pool, subject, fx.alice, Some(&state), None).await?;
        assert_eq!(saved.state.0, state);

        let res = super::mark_review(&fx.pool, subject, fx.bob).await;
        assert!(matches!(res, Err(Error::NotOwner { .. })), "{:?}", res);
        let next = super::mark_review(&fx.pool, subject, fx.alice).await?;
        assert_ne!(next.id, round.id);
        assert_eq!(next.status, InterpretationStatus::NotStarted);
        assert_eq!(next.workflow_status, WorkflowStatus::Review);
        assert_eq!(next.user_id, None);
        assert_eq!(next.state.0, state);

        super::start(&fx.pool, subject, fx.bob).await?;
        let next = super::mark_medicalreview(&fx.pool, subject, fx.bob).await?;
        assert_eq!(next.workflow_status, WorkflowStatus::MedicalReview);
        super::start(&fx.pool, subject, fx.alice).await?;
        let reassigned = super::reassign(&fx.pool, subject, fx.alice, fx.bob).await?;
        assert_eq!(reassigned.user_id, Some(fx.bob));
        let next = super::mark_notready(&fx.pool, subject, fx.bob).await?;
        assert_eq!(next.workflow_status, WorkflowStatus::NotReady);
        super::start(&fx.pool, subject, fx.bob).await?;
        let next = super::mark_interpretation(&fx.pool, subject, fx.bob).await?;
        assert_eq!(next.workflow_status, WorkflowStatus::Interpretation);

        // nothing was finalized and the waiting round cannot be reopened
        assert!(super::history(&fx.pool, subject).await?.is_empty());
        let res = super::reopen(&fx.pool, subject).await;
        assert!(matches!(res, Err(Error::InvalidTransition(_))), "{:?}", res);
        Ok(())
    }

    #[tokio::test]
    async fn finalize_writes_snapshots() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Analysis(fx.analysis_id);

        let filtered = super::filtered_alleles(&fx.pool, &fx.conf, fx.analysis_id, fx.filterconfig_id).await?;
        assert_eq!(filtered.remaining_allele_ids(), BTreeSet::from([fx.kept]));
        assert_eq!(
            filtered.excluded_allele_ids().get("callertype"),
            Some(&BTreeSet::from([fx.cnv]))
        );

        super::start(&fx.pool, subject, fx.alice).await?;
        let finalized = super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.alice,
            &request(&fx, class(Classification::Class5, None)),
        )
        .await?;
        assert_eq!(finalized.num_snapshots, 2);

        let round = super::current(&fx.pool, subject).await?;
        assert_eq!(round.status, InterpretationStatus::Done);
        assert!(round.finalized);
        assert_eq!(round.filterconfig_id, Some(fx.filterconfig_id));

        let history = super::history(&fx.pool, subject).await?;
        assert_eq!(history.len(), 1);
        let snapshots = &history[0].snapshots;
        let kept = snapshots.iter().find(|s| s.allele_id == fx.kept).unwrap();
        let cnv = snapshots.iter().find(|s| s.allele_id == fx.cnv).unwrap();
        assert_eq!(kept.filtered, None);
        assert_eq!(
            kept.alleleassessment_id,
            Some(finalized.committed.alleleassessments[&fx.kept])
        );
        assert_eq!(cnv.filtered.as_deref(), Some("callertype"));
        assert_eq!(cnv.alleleassessment_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn finalize_checks_decisions() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Analysis(fx.analysis_id);
        super::start(&fx.pool, subject, fx.alice).await?;

        let missing = FinalizeRequest {
            filterconfig_id: Some(fx.filterconfig_id),
            decisions: Decisions::default(),
        };
        let res = super::finalize(&fx.pool, &fx.conf, subject, fx.alice, &missing).await;
        assert!(matches!(res, Err(Error::Validation(_))), "{:?}", res);

        let mut extra = request(&fx, class(Classification::Class3, None));
        extra
            .decisions
            .alleleassessments
            .insert(fx.cnv, class(Classification::Class1, None));
        let res = super::finalize(&fx.pool, &fx.conf, subject, fx.alice, &extra).await;
        assert!(matches!(res, Err(Error::Validation(_))), "{:?}", res);

        let res = super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.bob,
            &request(&fx, class(Classification::Class3, None)),
        )
        .await;
        assert!(matches!(res, Err(Error::NotOwner { .. })), "{:?}", res);

        // failed attempts leave the round untouched
        let round = super::current(&fx.pool, subject).await?;
        assert_eq!(round.status, InterpretationStatus::Ongoing);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alleleassessment")
            .fetch_one(&fx.pool)
            .await?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn finalize_respects_workflow_requirements() -> Result<(), anyhow::Error> {
        let mut fx = fixture().await?;
        fx.conf.workflow.analysis.finalize_requirements.workflow_status = vec![WorkflowStatus::Review];
        let subject = Subject::Analysis(fx.analysis_id);
        super::start(&fx.pool, subject, fx.alice).await?;

        let res = super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.alice,
            &request(&fx, class(Classification::Class3, None)),
        )
        .await;
        assert!(matches!(res, Err(Error::InvalidTransition(_))), "{:?}", res);

        super::mark_review(&fx.pool, subject, fx.alice).await?;
        super::start(&fx.pool, subject, fx.bob).await?;
        super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.bob,
            &request(&fx, class(Classification::Class3, None)),
        )
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn second_finalize_conflicts() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Analysis(fx.analysis_id);
        super::start(&fx.pool, subject, fx.alice).await?;
        let payload = request(&fx, class(Classification::Class4, None));

        let first = super::finalize(&fx.pool, &fx.conf, subject, fx.alice, &payload).await;
        let second = super::finalize(&fx.pool, &fx.conf, subject, fx.alice, &payload).await;

        assert!(first.is_ok(), "{:?}", first);
        assert!(matches!(second, Err(Error::ConcurrencyConflict(_))), "{:?}", second);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alleleassessment")
            .fetch_one(&fx.pool)
            .await?;
        assert_eq!(count, 1);
        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysisinterpretationsnapshot")
            .fetch_one(&fx.pool)
            .await?;
        assert_eq!(snapshots, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_finalize_conflicts() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let url = format!("sqlite://{}", tmp_dir.join("ella.sqlite").to_string_lossy());
        let pool = crate::db::connect(&url).await?;
        crate::db::init(&pool, &Config::default()).await?;
        let fx = fixture_on(pool).await?;
        let subject = Subject::Analysis(fx.analysis_id);
        super::start(&fx.pool, subject, fx.alice).await?;
        let payload = request(&fx, class(Classification::Class4, None));

        let handles = (0..2)
            .map(|_| {
                let pool = fx.pool.clone();
                let conf = fx.conf.clone();
                let payload = payload.clone();
                let alice = fx.alice;
                tokio::spawn(async move { super::finalize(&pool, &conf, subject, alice, &payload).await })
            })
            .collect::<Vec<_>>();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await?);
        }

        assert_eq!(results.iter().filter(|res| res.is_ok()).count(), 1, "{:?}", results);
        assert_eq!(
            results
                .iter()
                .filter(|res| matches!(res, Err(Error::ConcurrencyConflict(_))))
                .count(),
            1,
            "{:?}",
            results
        );
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alleleassessment")
            .fetch_one(&fx.pool)
            .await?;
        assert_eq!(count, 1);
        let rounds: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT interpretation_id) FROM analysisinterpretationsnapshot",
        )
        .fetch_one(&fx.pool)
        .await?;
        assert_eq!(rounds, 1);
        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysisinterpretationsnapshot")
            .fetch_one(&fx.pool)
            .await?;
        assert_eq!(snapshots, 2);
        Ok(())
    }

    #[tokio::test]
    async fn reopen_and_finalize_again() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Analysis(fx.analysis_id);
        super::start(&fx.pool, subject, fx.alice).await?;
        let first = super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.alice,
            &request(&fx, class(Classification::Class4, None)),
        )
        .await?;
        let first_id = first.committed.alleleassessments[&fx.kept];

        let reopened = super::reopen(&fx.pool, subject).await?;
        assert_eq!(reopened.status, InterpretationStatus::NotStarted);
        super::start(&fx.pool, subject, fx.bob).await?;
        let second = super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.bob,
            &request(&fx, class(Classification::Class4, Some(first_id))),
        )
        .await?;
        let second_id = second.committed.alleleassessments[&fx.kept];

        let mut conn = fx.pool.acquire().await?;
        let history = crate::assessment::alleleassessment_history(&mut conn, fx.kept).await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second_id);
        assert_eq!(history[0].previous_assessment_id, Some(first_id));
        assert_eq!(history[0].classification, history[1].classification);
        assert_eq!(history[1].previous_assessment_id, None);
        drop(conn);

        assert_eq!(super::history(&fx.pool, subject).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn allele_rounds() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Allele(fx.cnv);
        let res = super::open(&fx.pool, subject, None).await;
        assert!(matches!(res, Err(Error::Validation(_))), "{:?}", res);
        let gp_key = crate::common::GpKey::new("HBOC", "v01");
        super::open(&fx.pool, subject, Some(&gp_key)).await?;
        super::start(&fx.pool, subject, fx.alice).await?;

        let payload = FinalizeRequest {
            filterconfig_id: None,
            decisions: Decisions {
                alleleassessments: [(fx.cnv, class(Classification::Class2, None))].into(),
                ..Default::default()
            },
        };
        let finalized = super::finalize(&fx.pool, &fx.conf, subject, fx.alice, &payload).await?;
        assert_eq!(finalized.num_snapshots, 1);
        let res = super::open(&fx.pool, subject, Some(&gp_key)).await;
        assert!(matches!(res, Err(Error::InvalidTransition(_))), "{:?}", res);
        Ok(())
    }

    #[tokio::test]
    async fn delete_analysis_keeps_alleles_and_assessments() -> Result<(), anyhow::Error> {
        let fx = fixture().await?;
        let subject = Subject::Analysis(fx.analysis_id);
        super::start(&fx.pool, subject, fx.alice).await?;
        super::finalize(
            &fx.pool,
            &fx.conf,
            subject,
            fx.alice,
            &request(&fx, class(Classification::Class3, None)),
        )
        .await?;

        super::delete_analysis(&fx.pool, fx.analysis_id).await?;

        for (table, expected) in [
            ("analysis", 0),
            ("sample", 0),
            ("genotype", 0),
            ("genotypesampledata", 0),
            ("analysisinterpretation", 0),
            ("analysisinterpretationsnapshot", 0),
            ("allele", 2),
            ("alleleassessment", 1),
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&fx.pool)
                .await?;
            assert_eq!(count, expected, "{}", table);
        }
        let analysis_id: Option<i64> = sqlx::query_scalar("SELECT analysis_id FROM alleleassessment")
            .fetch_one(&fx.pool)
            .await?;
        assert_eq!(analysis_id, None);

        let res = super::delete_analysis(&fx.pool, fx.analysis_id).await;
        assert!(matches!(res, Err(Error::NotFound { .. })), "{:?}", res);
        Ok(())
    }
}
