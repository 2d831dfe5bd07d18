use crate::credit::grant::Grant;

/// Orders grants for depletion: priority ascending, ties broken by earliest expiration.
///
/// Returns a new view; the caller's slice is never reordered.
pub fn prioritize<'a, I>(grants: I) -> Vec<&'a Grant>
where
    I: IntoIterator<Item = &'a Grant>,
{
    let mut ordered: Vec<&Grant> = grants.into_iter().collect();
    // Both sorts are stable, so the second keeps the expiration order inside each priority.
    ordered.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
    ordered.sort_by(|a, b| a.priority.cmp(&b.priority));
    ordered
}
