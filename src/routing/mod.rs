pub mod router;

pub use router::{Route, RouteMatch, RouteTable};
