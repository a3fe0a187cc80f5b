use std::sync::Arc;
use std::thread;

use quorum::{CommContext, GroupComm, LocalCluster, LocalEndpoint, StaticTopology};

/// Run `f` concurrently on one OS thread per rank of the given node
/// layout, joining all threads before returning. Any rank panicking
/// fails the test.
pub fn run_ranks<F>(ranks_per_node: &[usize], f: F)
where
    F: Fn(Arc<LocalEndpoint>) + Send + Sync + 'static,
{
    let endpoints = LocalCluster::launch(ranks_per_node);
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for ep in endpoints {
        let ep = Arc::new(ep);
        let f = Arc::clone(&f);
        handles.push(thread::spawn(move || f(ep)));
    }
    for h in handles {
        h.join().expect("rank thread panicked");
    }
}

/// Adapter context plus topology facts for one endpoint.
pub fn ctx_for(ep: &Arc<LocalEndpoint>) -> (Arc<CommContext>, StaticTopology) {
    let scopes = ep.scope_map();
    let topology = ep.topology();
    let ctx = Arc::new(CommContext::new(
        Arc::clone(ep) as Arc<dyn GroupComm>,
        scopes,
    ));
    (ctx, topology)
}
