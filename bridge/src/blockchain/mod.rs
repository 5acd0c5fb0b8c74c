/// Blockchain communication module
/// Node access, block templates and the job cache sessions mine against

pub mod block;
pub mod node;
pub mod refresher;
pub mod rpc_client;
pub mod template_cache;

pub use block::{BlockTemplate, RpcBlock, RpcBlockHeader};
pub use node::{NodeClient, NodeError, NodeHandle, RetryPolicy, SubmitOutcome, TipChanged};
pub use refresher::TemplateRefresher;
pub use rpc_client::SpectreRpcClient;
pub use template_cache::{TemplateCache, TemplateSnapshot, WorkTemplate};
