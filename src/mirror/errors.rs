use octocrab::Error as OctocrabError;

#[derive(Debug)]
pub enum MirrorError {
    TokenNotFound(String),
    Disabled,
    ApiError(OctocrabError),
    NotFound { remote_id: String },
    InvalidRemoteId(String),
}

impl MirrorError {
    /// The remote side no longer has the record (deleted by hand, PR closed...).
    pub fn is_not_found(&self) -> bool {
        match self {
            MirrorError::NotFound { .. } => true,
            MirrorError::ApiError(OctocrabError::GitHub { source, .. }) => {
                source.status_code.as_u16() == 404
            }
            _ => false,
        }
    }
}

impl From<OctocrabError> for MirrorError {
    fn from(err: OctocrabError) -> Self {
        MirrorError::ApiError(err)
    }
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorError::TokenNotFound(msg) => {
                writeln!(f, "Review Thread Authentication Error")?;
                writeln!(f, "──────────────────────────────────")?;
                write!(f, "🔑 {msg}\n\n")?;
                writeln!(f, "🔧 QUICK FIXES:")?;
                writeln!(f, "   → Use GitHub CLI: export GITHUB_TOKEN=\"$(gh auth token)\"")?;
                writeln!(f, "   → Or set it for duo only: export DUO_MIRROR__TOKEN=your_token")?;
                write!(
                    f,
                    "   → Token needs 'repo' scope (or 'public_repo' for public repositories)"
                )
            }
            MirrorError::Disabled => {
                writeln!(f, "Review Thread Mirror Disabled")?;
                writeln!(f, "─────────────────────────────")?;
                write!(f, "🔌 mirror.enabled is false, nothing was sent\n\n")?;
                writeln!(f, "🔧 TO ENABLE:")?;
                writeln!(f, "   → Set [mirror] enabled = true in duo.toml")?;
                write!(f, "   → Or export DUO_MIRROR__ENABLED=true")
            }
            MirrorError::ApiError(octocrab_err) => {
                writeln!(f, "GitHub API Error")?;
                writeln!(f, "────────────────")?;

                match octocrab_err {
                    OctocrabError::GitHub { source, .. } => {
                        writeln!(f, "🌐 HTTP {}: {}", source.status_code, source.message)?;
                        writeln!(f)?;

                        match source.status_code.as_u16() {
                            401 => {
                                writeln!(f, "🔧 AUTHENTICATION FAILED:")?;
                                writeln!(f, "   → Token is invalid or expired")?;
                                write!(f, "   → Run: gh auth login")
                            }
                            403 => {
                                writeln!(f, "🔧 PERMISSION DENIED:")?;
                                writeln!(f, "   → Token cannot comment on this pull request")?;
                                write!(f, "   → Check rate limits: gh api rate_limit")
                            }
                            404 => {
                                writeln!(f, "🔧 RESOURCE NOT FOUND:")?;
                                writeln!(f, "   → Check DROID_REPO and DROID_PR_NUMBER")?;
                                write!(f, "   → The comment may have been deleted by hand")
                            }
                            _ => {
                                writeln!(f, "🔧 TROUBLESHOOTING:")?;
                                writeln!(f, "   → Check authentication: gh auth status")?;
                                write!(f, "   → Verify repository access: gh repo view")
                            }
                        }
                    }
                    OctocrabError::Http { .. } => {
                        write!(f, "🌐 Network connection failed: {octocrab_err}\n\n")?;
                        writeln!(f, "🔧 TROUBLESHOOTING:")?;
                        writeln!(f, "   → Test HTTPS: curl -I https://api.github.com")?;
                        writeln!(f, "   → Check mirror.api_base in duo.toml")?;
                        write!(f, "   → Local state is unaffected; re-run to retry")
                    }
                    _ => {
                        write!(f, "🌐 {octocrab_err}\n\n")?;
                        writeln!(f, "🔧 TROUBLESHOOTING:")?;
                        writeln!(f, "   → Check authentication: gh auth status")?;
                        write!(f, "   → Local state is unaffected; re-run to retry")
                    }
                }
            }
            MirrorError::NotFound { remote_id } => {
                writeln!(f, "Review Comment Not Found")?;
                writeln!(f, "────────────────────────")?;
                write!(f, "🔍 No comment with id {remote_id} on this pull request\n\n")?;
                writeln!(f, "🔧 QUICK FIXES:")?;
                write!(f, "   → List duo comments: duo comment list")
            }
            MirrorError::InvalidRemoteId(raw) => {
                writeln!(f, "Invalid Comment Id")?;
                writeln!(f, "──────────────────")?;
                write!(f, "🔢 '{raw}' is not a numeric comment id\n\n")?;
                write!(f, "🔧 Use the id column from: duo comment list")
            }
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MirrorError::ApiError(err) => Some(err),
            _ => None,
        }
    }
}
