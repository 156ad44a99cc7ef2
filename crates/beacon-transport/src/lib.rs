pub mod http;
pub mod interceptor;
pub mod mock;

pub use http::{checksum256, HttpTransport, HttpTransportConfig};
pub use interceptor::{HttpMethod, PreparedRequest, RequestInterceptor, StaticHeaders};
pub use mock::{MockReply, MockTransport};
