use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::client::client_error::{ClientError, ProtocolViolation};
use crate::client::pending::Completer;

/// A query whose results are still outstanding after the server acknowledged it
pub enum PendingQuery {
    /// point lookup, completing with the single result or `None`
    Single(Completer<Option<Value>>),
    /// collects all results, completing when the announced number has arrived
    All {
        expected: u32,
        results: Vec<Value>,
        completer: Completer<Vec<Value>>,
    },
}

impl PendingQuery {
    pub fn fail(self, err: ClientError) {
        let _ = match self {
            PendingQuery::Single(completer) => completer.send(Err(err)).map_err(|_| ()),
            PendingQuery::All { completer, .. } => completer.send(Err(err)).map_err(|_| ()),
        };
    }

    /// Handles the result count from the query's acknowledgment. Returns the query if results
    ///  are still to be expected, after completing it otherwise.
    ///
    /// A point lookup with more than one result means the server disagrees about the query's
    ///  semantics, which is a protocol violation.
    pub fn on_count(self, query_id: u32, count: u32) -> Result<Option<PendingQuery>, ProtocolViolation> {
        match self {
            PendingQuery::Single(completer) => match count {
                0 => {
                    let _ = completer.send(Ok(None));
                    Ok(None)
                }
                1 => Ok(Some(PendingQuery::Single(completer))),
                n => {
                    let violation = ProtocolViolation(format!("point lookup {} announced {} results", query_id, n));
                    let _ = completer.send(Err(violation.clone().into()));
                    Err(violation)
                }
            },
            PendingQuery::All { completer, .. } => {
                if count == 0 {
                    let _ = completer.send(Ok(Vec::new()));
                    Ok(None)
                }
                else {
                    Ok(Some(PendingQuery::All {
                        expected: count,
                        results: Vec::with_capacity(count as usize),
                        completer,
                    }))
                }
            }
        }
    }

    fn on_result(self, result: Value) -> Option<PendingQuery> {
        match self {
            PendingQuery::Single(completer) => {
                let _ = completer.send(Ok(Some(result)));
                None
            }
            PendingQuery::All { expected, mut results, completer } => {
                results.push(result);
                if results.len() >= expected as usize {
                    let _ = completer.send(Ok(results));
                    None
                }
                else {
                    Some(PendingQuery::All { expected, results, completer })
                }
            }
        }
    }
}

/// Matches QUERYRESULT frames to their queries by query ID
pub struct QueryCorrelator {
    state: Mutex<QueryCorrelatorState>,
}

#[derive(Default)]
struct QueryCorrelatorState {
    closed: bool,
    pending: FxHashMap<u32, PendingQuery>,
}

impl QueryCorrelator {
    pub fn new() -> QueryCorrelator {
        QueryCorrelator {
            state: Default::default(),
        }
    }

    pub fn register(&self, query_id: u32, query: PendingQuery) -> Result<(), ProtocolViolation> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            query.fail(ClientError::ConnectionClosed);
            return Ok(());
        }
        if state.pending.contains_key(&query_id) {
            drop(state);
            let violation = ProtocolViolation(format!("query {} is already pending", query_id));
            query.fail(violation.clone().into());
            return Err(violation);
        }

        trace!(query_id, "registering pending query");
        state.pending.insert(query_id, query);
        Ok(())
    }

    /// Delivers a result to the pending query. An unknown query ID, which includes queries that
    ///  already received all their results, is a protocol violation.
    pub fn on_result(&self, query_id: u32, result: Value) -> Result<(), ProtocolViolation> {
        let mut state = self.state.lock();
        let Some(query) = state.pending.remove(&query_id) else {
            return Err(ProtocolViolation(format!("received a result for query {} which is not pending", query_id)));
        };

        // completing a oneshot does not block, so this is fine to do while holding the lock
        match query.on_result(result) {
            Some(remaining) => {
                state.pending.insert(query_id, remaining);
            }
            None => {
                trace!(query_id, "query complete");
            }
        }
        Ok(())
    }

    pub fn contains(&self, query_id: u32) -> bool {
        self.state.lock().pending.contains_key(&query_id)
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Fail all pending queries with [ClientError::ConnectionClosed], and refuse new ones
    pub fn close(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            debug!("failing {} pending queries", pending.len());
        }
        for (_, query) in pending {
            query.fail(ClientError::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use serde_json::json;

    use crate::client::pending::Pending;

    use super::*;

    #[rstest]
    #[case::none(0, Some(None), false)]
    #[case::one(1, None, true)]
    #[case::two(2, None, false)]
    #[tokio::test]
    async fn test_single_on_count(#[case] count: u32, #[case] immediate: Option<Option<Value>>, #[case] expect_pending: bool) {
        let (completer, pending) = Pending::new(None);
        let result = PendingQuery::Single(completer).on_count(5, count);

        match result {
            Ok(Some(_)) => assert!(expect_pending),
            Ok(None) => {
                assert!(!expect_pending);
                assert_eq!(pending.await.unwrap(), immediate.unwrap());
            }
            Err(_) => {
                assert!(!expect_pending);
                assert!(immediate.is_none());
                assert!(matches!(pending.await, Err(ClientError::ProtocolViolation(_))));
            }
        }
    }

    #[tokio::test]
    async fn test_all_with_zero_results() {
        let (completer, pending) = Pending::new(None);
        let query = PendingQuery::All { expected: 0, results: vec![], completer };
        assert!(query.on_count(1, 0).unwrap().is_none());
        assert_eq!(pending.await.unwrap(), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn test_single_result() {
        let correlator = QueryCorrelator::new();
        let (completer, pending) = Pending::new(None);
        correlator.register(3, PendingQuery::Single(completer)).unwrap();
        assert!(correlator.contains(3));

        correlator.on_result(3, json!({"id": 42})).unwrap();
        assert!(!correlator.contains(3));
        assert_eq!(pending.await.unwrap(), Some(json!({"id": 42})));

        assert!(correlator.on_result(3, json!(null)).is_err());
    }

    #[tokio::test]
    async fn test_all_results_in_arrival_order() {
        let correlator = QueryCorrelator::new();
        let (completer, pending) = Pending::new(None);
        let query = PendingQuery::All { expected: 0, results: vec![], completer }
            .on_count(8, 3)
            .unwrap()
            .unwrap();
        correlator.register(8, query).unwrap();

        correlator.on_result(8, json!(1)).unwrap();
        correlator.on_result(8, json!(2)).unwrap();
        assert!(correlator.contains(8));
        correlator.on_result(8, json!(3)).unwrap();
        assert!(!correlator.contains(8));

        assert_eq!(pending.await.unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_unknown_query_id() {
        let correlator = QueryCorrelator::new();
        assert!(correlator.on_result(77, json!(null)).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let correlator = QueryCorrelator::new();
        let (completer1, _pending1) = Pending::new(None);
        let (completer2, pending2) = Pending::new(None);

        correlator.register(1, PendingQuery::Single(completer1)).unwrap();
        assert!(correlator.register(1, PendingQuery::Single(completer2)).is_err());
        assert!(matches!(pending2.await, Err(ClientError::ProtocolViolation(_))));
        assert_eq!(correlator.num_pending(), 1);
    }

    #[tokio::test]
    async fn test_close() {
        let correlator = QueryCorrelator::new();
        let (completer, pending) = Pending::new(None);
        correlator.register(1, PendingQuery::Single(completer)).unwrap();

        correlator.close();
        assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
        assert_eq!(correlator.num_pending(), 0);

        let (completer, pending) = Pending::new(None);
        correlator.register(2, PendingQuery::Single(completer)).unwrap();
        assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
    }
}
