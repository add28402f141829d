pub use super::{
    charts::Entity as Charts, deferred_events::Entity as DeferredEvents,
    digests::Entity as Digests, external_ids::Entity as ExternalIds,
    full_journal_states::Entity as FullJournalStates, instances::Entity as Instances,
    journal_entries::Entity as JournalEntries, ongoing_activities::Entity as OngoingActivities,
};
