use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(ModelError::Blank(what).into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn upsert_location(
        &self,
        id: Ulid,
        name: String,
        timezone: &str,
    ) -> Result<Location, EngineError> {
        check_name(&name, "location name")?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| EngineError::validation(format!("unknown time zone: {timezone}")))?;

        let _gate = self.begin_write().await;
        let _dir = self.directory_lock.lock().await;
        let event = Event::LocationUpserted {
            id,
            name: name.clone(),
            timezone: tz.name().to_string(),
        };
        self.commit(&event, |s| s.apply_directory(&event)).await?;
        tracing::info!("location {id} upserted ({})", tz.name());
        Ok(Location {
            id,
            name,
            timezone: tz,
        })
    }

    pub async fn upsert_service(&self, service: Service) -> Result<Service, EngineError> {
        check_name(&service.name, "service name")?;
        service.validate()?;
        if service.duration_min > MAX_SERVICE_MINUTES
            || service.buffer_before_min > MAX_SERVICE_MINUTES
            || service.buffer_after_min > MAX_SERVICE_MINUTES
        {
            return Err(EngineError::LimitExceeded("service too long"));
        }

        let _gate = self.begin_write().await;
        let _dir = self.directory_lock.lock().await;
        let event = Event::ServiceUpserted {
            service: service.clone(),
        };
        self.commit(&event, |s| s.apply_directory(&event)).await?;
        tracing::info!("service {} upserted", service.id);
        Ok(service)
    }

    /// Replace a staff member. A value without time off keeps the time off
    /// already on file; time off changes go through `add_time_off` and
    /// `remove_time_off`. Existing appointments are kept even if the new
    /// schedule no longer covers them.
    pub async fn upsert_staff(&self, mut staff: StaffMember) -> Result<StaffMember, EngineError> {
        check_name(&staff.name, "staff name")?;
        if staff.categories.len() > MAX_CATEGORIES_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many categories"));
        }
        if staff.time_off.len() > MAX_TIME_OFF_PER_STAFF {
            return Err(EngineError::LimitExceeded("too much time off"));
        }
        staff.validate()?;

        let _gate = self.begin_write().await;
        let _dir = self.directory_lock.lock().await;
        if self.store.location(&staff.location_id).is_none() {
            return Err(EngineError::NotFound {
                kind: "location",
                id: staff.location_id,
            });
        }
        let existing = self.store.staff(&staff.id);
        let moving_in = existing
            .as_ref()
            .is_none_or(|old| old.location_id != staff.location_id);
        if moving_in && self.store.staff_at(&staff.location_id).len() >= MAX_STAFF_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many staff at location"));
        }
        // Merged under the directory lock so a concurrent `add_time_off`
        // cannot be overwritten.
        if staff.time_off.is_empty()
            && let Some(old) = existing
        {
            staff.time_off = old.time_off;
        }

        let event = Event::StaffUpserted {
            staff: staff.clone(),
        };
        self.commit(&event, |s| s.apply_directory(&event)).await?;
        tracing::info!("staff {} upserted at {}", staff.id, staff.location_id);
        Ok(staff)
    }

    pub async fn add_time_off(
        &self,
        staff_id: Ulid,
        time_off: TimeOff,
    ) -> Result<StaffMember, EngineError> {
        let _gate = self.begin_write().await;
        let _dir = self.directory_lock.lock().await;
        let mut staff = self.staff_member(&staff_id)?;
        if staff.time_off.iter().any(|t| t.id == time_off.id) {
            return Err(EngineError::AlreadyExists(time_off.id));
        }
        if staff.time_off.len() >= MAX_TIME_OFF_PER_STAFF {
            return Err(EngineError::LimitExceeded("too much time off"));
        }
        // Validate the whole member as it would look afterwards.
        staff.time_off.push(time_off.clone());
        staff.time_off.sort_by_key(|t| t.start);
        staff.validate()?;

        let event = Event::TimeOffAdded { staff_id, time_off };
        self.commit(&event, |s| s.apply_directory(&event)).await?;
        Ok(staff)
    }

    pub async fn remove_time_off(&self, staff_id: Ulid, id: Ulid) -> Result<StaffMember, EngineError> {
        let _gate = self.begin_write().await;
        let _dir = self.directory_lock.lock().await;
        let mut staff = self.staff_member(&staff_id)?;
        let before = staff.time_off.len();
        staff.time_off.retain(|t| t.id != id);
        if staff.time_off.len() == before {
            return Err(EngineError::NotFound { kind: "time off", id });
        }

        let event = Event::TimeOffRemoved { staff_id, id };
        self.commit(&event, |s| s.apply_directory(&event)).await?;
        Ok(staff)
    }

    /// Find which staff member owns a time-off entry.
    pub fn time_off_owner(&self, id: &Ulid) -> Option<Ulid> {
        self.store
            .staff_ids()
            .into_iter()
            .filter_map(|sid| self.store.staff(&sid))
            .find(|s| s.time_off.iter().any(|t| t.id == *id))
            .map(|s| s.id)
    }

    pub fn location(&self, id: &Ulid) -> Result<Location, EngineError> {
        self.store
            .location(id)
            .ok_or(EngineError::NotFound { kind: "location", id: *id })
    }

    pub fn staff_member(&self, id: &Ulid) -> Result<StaffMember, EngineError> {
        self.store
            .staff(id)
            .ok_or(EngineError::NotFound { kind: "staff", id: *id })
    }

    pub fn service(&self, id: &Ulid) -> Result<Service, EngineError> {
        self.store
            .service(id)
            .ok_or(EngineError::NotFound { kind: "service", id: *id })
    }

    /// Services in request order; empty, oversized or unknown lists fail.
    pub fn resolve_services(&self, ids: &[Ulid]) -> Result<Vec<Service>, EngineError> {
        if ids.is_empty() {
            return Err(EngineError::validation("at least one service is required"));
        }
        if ids.len() > MAX_SERVICES_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        ids.iter().map(|id| self.service(id)).collect()
    }

}
