pub mod issue;
pub mod pull_request;
pub mod review_comment;
