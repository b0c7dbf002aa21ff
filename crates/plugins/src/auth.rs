use benchbot_core::models::AuthorAssociation;

use crate::PipelineError;

/// Only repository collaborators, members and owners may trigger dispatches.
pub fn verify_author(
    author: &str,
    association: &AuthorAssociation,
    plugin: &str,
) -> Result<(), PipelineError> {
    match association {
        AuthorAssociation::Collaborator | AuthorAssociation::Member | AuthorAssociation::Owner => {
            Ok(())
        }
        _ => Err(PipelineError::Unauthorized {
            author: author.to_string(),
            plugin: plugin.to_string(),
        }),
    }
}
