//! # 会话模块
//!
//! 会话身份解析与控制台 HTML 改写

pub mod html;
pub mod identity;

pub use html::{HtmlRewriter, is_html};
pub use identity::{
    NewSessionRedirect, ResolvedSession, SessionResolver, SessionSource, build_cookie,
    parse_cookie, scoped_base_path,
};
