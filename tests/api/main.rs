mod rides;
