//! Painless sources evaluated by the store. Each one re-checks the schema tag and the
//! caller's clock before touching a document, so the decision and the write are one
//! atomic step on the shard that owns the document.

/// Claim or re-affirm a single lease. Used both for the scripted upsert of a named item
/// and for the update-by-query that claims any eligible item. A claim stamps the
/// caller's `claimToken` so the claimant can find exactly the document it took.
pub const CLAIM_LEASE: &str = r#"
if (ctx._source.scriptVersion != params.scriptVersion) {
  throw new IllegalArgumentException('scriptVersion mismatch: ' + ctx._source.scriptVersion);
}
long serverTimeSeconds = System.currentTimeMillis() / 1000;
if (Math.abs(params.clientTimestamp - serverTimeSeconds) > params.tolerableDriftSecs) {
  throw new IllegalArgumentException('clock drift: server=' + serverTimeSeconds);
}
long attempts = ctx._source.numAttempts;
long newExpiration = params.clientTimestamp + ((long) Math.pow(2, attempts)) * params.expirationWindow;
if (ctx._source.completedAt != null || ctx._source.failedAt != null) {
  ctx.op = 'noop';
} else if (params.workerId == ctx._source.leaseHolderId && ctx._source.expiration > serverTimeSeconds) {
  ctx.op = 'noop';
} else if (ctx._source.expiration < serverTimeSeconds && ctx._source.expiration < newExpiration) {
  ctx._source.leaseHolderId = params.workerId;
  ctx._source.expiration = newExpiration;
  ctx._source.numAttempts = attempts + 1;
  ctx._source.claimToken = params.claimToken;
} else {
  ctx.op = 'noop';
}
"#;

pub const COMPLETE_WORK_ITEM: &str = r#"
if (ctx._source.scriptVersion != params.scriptVersion) {
  throw new IllegalArgumentException('scriptVersion mismatch: ' + ctx._source.scriptVersion);
}
if (ctx._source.leaseHolderId != params.workerId) {
  throw new IllegalArgumentException('work item held by: ' + ctx._source.leaseHolderId);
}
if (ctx._source.completedAt == null && ctx._source.failedAt == null) {
  ctx._source.completedAt = System.currentTimeMillis() / 1000;
} else {
  ctx.op = 'noop';
}
"#;

pub const FAIL_WORK_ITEM: &str = r#"
if (ctx._source.scriptVersion != params.scriptVersion) {
  throw new IllegalArgumentException('scriptVersion mismatch: ' + ctx._source.scriptVersion);
}
if (ctx._source.leaseHolderId != params.workerId) {
  throw new IllegalArgumentException('work item held by: ' + ctx._source.leaseHolderId);
}
if (ctx._source.completedAt == null && ctx._source.failedAt == null) {
  ctx._source.failedAt = System.currentTimeMillis() / 1000;
} else {
  ctx.op = 'noop';
}
"#;

pub const SCRIPT_VERSION_MISMATCH_PREFIX: &str = "scriptVersion mismatch: ";
pub const CLOCK_DRIFT_PREFIX: &str = "clock drift: server=";
pub const HELD_BY_PREFIX: &str = "work item held by: ";
